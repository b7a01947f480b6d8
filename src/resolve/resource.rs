//! Modules whose default export is a public URI obtained from the host.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde_json::Value;
use sugar_path::SugarPath;

use super::{content_hash, js_string, Resolution, SyntheticModule, RESOURCE_ROOT};
use crate::bundle::Target;
use crate::engine::ModuleRequest;
use crate::error::Result;
use crate::rpc::{RpcInvoker, RpcRequest, RpcResponse};

pub const RESOURCE_SCHEME: &str = "resource://";
pub const RESOURCE_URI_HELPER: &str = "@ssr/internal.ResourceUri";
pub const ASSET_URI_HELPER: &str = "@ssr/internal.GetResourceUri";
pub const COPY_RESOURCES_HELPER: &str = "@ssr/internal.CopyResources";
pub const ASSET_EXTENSIONS: &[&str] = &["svg", "png", "jpg", "gif", "css"];

/// Serves `resource://...` specifiers.
pub struct ResourceProvider {
    rpc: Rc<dyn RpcInvoker>,
}

impl ResourceProvider {
    pub fn new(rpc: Rc<dyn RpcInvoker>) -> Self {
        Self { rpc }
    }

    pub async fn handle(&mut self, request: &ModuleRequest) -> Result<Option<Resolution>> {
        if !request.specifier.starts_with(RESOURCE_SCHEME) {
            return Ok(None);
        }

        let call = RpcRequest::new(RESOURCE_URI_HELPER).with("path", request.specifier.as_str());
        let content = uri_module(&request.specifier, self.rpc.call(call).await);

        Ok(Some(Resolution::Module(SyntheticModule::virtual_file(
            synthetic_filename(&request.specifier),
            content,
        ))))
    }
}

/// Serves imports of static assets next to the program's sources and asks
/// the host to publish them once a server build completes.
pub struct AssetProvider {
    rpc: Rc<dyn RpcInvoker>,
    resources: Vec<PathBuf>,
}

impl AssetProvider {
    pub fn new(rpc: Rc<dyn RpcInvoker>) -> Self {
        Self {
            rpc,
            resources: Vec::new(),
        }
    }

    pub async fn handle(&mut self, request: &ModuleRequest) -> Result<Option<Resolution>> {
        let Some(source_path) = asset_path(request) else {
            return Ok(None);
        };
        let source = source_path.to_string_lossy().into_owned();

        let call = RpcRequest::new(ASSET_URI_HELPER).with("sourcePath", source.as_str());
        let content = uri_module(&source, self.rpc.call(call).await);
        if !self.resources.contains(&source_path) {
            self.resources.push(source_path);
        }

        Ok(Some(Resolution::Module(SyntheticModule::virtual_file(
            synthetic_filename(&source),
            content,
        ))))
    }

    pub fn resources(&self) -> &[PathBuf] {
        &self.resources
    }

    pub async fn finalize(&mut self, target: Target) -> Result<()> {
        if target != Target::Server || self.resources.is_empty() {
            return Ok(());
        }

        let resources: Vec<Value> = self
            .resources
            .iter()
            .map(|path| Value::String(path.to_string_lossy().into_owned()))
            .collect();
        let call = RpcRequest::new(COPY_RESOURCES_HELPER).with("resources", resources);

        match self.rpc.call(call).await {
            Ok(RpcResponse { error: Some(error), .. }) => {
                tracing::warn!("Copying resources failed: {}", error.message)
            }
            Err(e) => tracing::warn!("Copying resources failed: {}", e),
            Ok(_) => tracing::debug!(count = self.resources.len(), "Copied resources"),
        }
        Ok(())
    }
}

fn asset_path(request: &ModuleRequest) -> Option<PathBuf> {
    let specifier = request.specifier.as_str();
    if specifier.contains("://") || specifier.contains('!') {
        return None;
    }
    if !(specifier.starts_with('.') || specifier.starts_with('/')) {
        return None;
    }

    let extension = Path::new(specifier).extension()?.to_str()?;
    if !ASSET_EXTENSIONS.contains(&extension) {
        return None;
    }

    Some(Path::new(&request.path).join(specifier).normalize())
}

fn synthetic_filename(key: &str) -> String {
    format!("{}/{}.js", RESOURCE_ROOT, content_hash(key))
}

/// A failed lookup still yields a module; it logs the failure when evaluated
/// and exports `null`.
fn uri_module(key: &str, response: Result<RpcResponse>) -> String {
    let (message, stack) = match response {
        Ok(RpcResponse {
            error: Some(error), ..
        }) => (error.message, error.stack.unwrap_or_default()),
        Ok(RpcResponse { data, .. }) => {
            return format!("export default {};", data.unwrap_or(Value::Null));
        }
        Err(e) => (e.to_string(), String::new()),
    };

    tracing::warn!(resource = key, "Resource lookup failed: {}", message);
    format!(
        "console.error({});\nconsole.error({});\nexport default null;",
        js_string(&message),
        js_string(&stack)
    )
}
