//! Helper namespaces exposed to programs as generated modules.
//!
//! `<helper>` resolves to a facade re-exporting the optional extension file
//! and every dynamic capability, `<helper>/_rpc` to the RPC-backed bindings,
//! and `<helper>/<name>` to `<name>.js` next to the extension file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sugar_path::SugarPath;

use super::{content_hash, js_string, Resolution, SyntheticModule, HELPER_ROOT};
use crate::engine::ModuleRequest;
use crate::error::{Error, Result};

pub const EXTENSION_KEY: &str = "__extension";
pub const RPC_SUFFIX: &str = "_rpc";

/// Configuration of one helper namespace, as sent by the host:
/// `{ "__extension": "/path/helper.js", "Menu": true, "Search": false }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelperConfig {
    #[serde(rename = "__extension", default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<PathBuf>,
    #[serde(flatten)]
    pub capabilities: IndexMap<String, bool>,
}

impl HelperConfig {
    /// Capabilities bound to RPC, in declaration order.
    pub fn dynamic_capabilities(&self) -> Vec<&str> {
        self.capabilities
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

pub type Helpers = IndexMap<String, HelperConfig>;

pub struct HelperProvider {
    helpers: Helpers,
    /// Synthetic directory hash to helper name, for requests issued from
    /// inside a generated facade.
    known_hashes: HashMap<String, String>,
}

impl HelperProvider {
    pub fn new(helpers: Helpers) -> Self {
        Self {
            helpers,
            known_hashes: HashMap::new(),
        }
    }

    pub async fn handle(&mut self, request: &ModuleRequest) -> Result<Option<Resolution>> {
        if let Some((helper, sub_path)) = self.namespace_of(&request.specifier) {
            let module = match sub_path {
                None | Some("") => self.facade_module(&helper).await?,
                Some(RPC_SUFFIX) => self.rpc_module(&helper)?,
                Some(sub_path) => {
                    let sub_path = sub_path.to_string();
                    self.sub_helper_module(&helper, &sub_path).await?
                }
            };
            return Ok(Some(Resolution::Module(module)));
        }

        Ok(self
            .sibling_of_facade(request)
            .await
            .map(Resolution::Module))
    }

    /// Longest helper name the specifier equals or is nested under.
    fn namespace_of<'a>(&self, specifier: &'a str) -> Option<(String, Option<&'a str>)> {
        self.helpers
            .keys()
            .filter_map(|name| {
                if specifier == name {
                    Some((name, None))
                } else {
                    specifier
                        .strip_prefix(name.as_str())
                        .and_then(|rest| rest.strip_prefix('/'))
                        .map(|sub_path| (name, Some(sub_path)))
                }
            })
            .max_by_key(|(name, _)| name.len())
            .map(|(name, sub_path)| (name.clone(), sub_path))
    }

    fn to_filename(&mut self, package: &str) -> String {
        let hash = content_hash(package);
        let filename = format!("{}/{}/index.js", HELPER_ROOT, hash);
        self.known_hashes.insert(hash, package.to_string());
        filename
    }

    async fn facade_module(&mut self, helper: &str) -> Result<SyntheticModule> {
        let config = self.config(helper)?.clone();
        let capabilities = config.dynamic_capabilities();

        if capabilities.is_empty() {
            if let Some(extension) = &config.extension {
                return Ok(SyntheticModule::file(extension));
            }
        }

        let mut code = String::new();
        let mut extension_source = None;
        if let Some(extension) = &config.extension {
            let source = tokio::fs::read_to_string(extension)
                .await
                .map_err(|e| Error::io(extension, e))?;
            code.push_str(&source);
            code.push('\n');
            extension_source = Some((extension, source));
        }

        if capabilities.is_empty() {
            code.push_str("export {};");
        } else {
            code.push_str(&format!(
                "export {{ {} }} from {};",
                capabilities.join(", "),
                js_string(&format!("{}/{}", helper, RPC_SUFFIX))
            ));
        }

        let filename = self.to_filename(helper);
        if let Some((extension, source)) = extension_source {
            code.push_str("\n//# sourceMappingURL=");
            code.push_str(&inline_source_map(&filename, extension, &source));
        }

        Ok(SyntheticModule::virtual_file(filename, code))
    }

    fn rpc_module(&mut self, helper: &str) -> Result<SyntheticModule> {
        let config = self.config(helper)?;
        let mut code = String::from(
            "const __ssrInvoke = (request) =>\n  typeof __rpc === \"function\"\n    ? __rpc(request)\n    : Promise.reject(new Error(\"RPC bridge is not available\"));\n",
        );

        for capability in config.dynamic_capabilities() {
            if !is_identifier(capability) {
                return Err(Error::Configuration(format!(
                    "Helper {} declares capability '{}' which is not a valid export name",
                    helper, capability
                )));
            }
            code.push_str(&format!(
                "\nexport const {name} = ({{ forceFetch = false, ...variables }} = {{}}) =>\n  __ssrInvoke({{ helper: {helper}, variables, forceFetch }});\n",
                name = capability,
                helper = js_string(&format!("{}.{}", helper, capability)),
            ));
        }

        let filename = self.to_filename(&format!("{}{}", helper, RPC_SUFFIX));
        Ok(SyntheticModule::virtual_file(filename, code))
    }

    async fn sub_helper_module(&self, helper: &str, sub_path: &str) -> Result<SyntheticModule> {
        let not_found = |reason: String| Error::HelperNotFound {
            helper: helper.to_string(),
            sub_path: sub_path.to_string(),
            reason,
        };

        let extension = self
            .config(helper)?
            .extension
            .as_ref()
            .ok_or_else(|| not_found("no main extension file is configured".into()))?;

        let resolved = sibling_path(extension, sub_path);
        if !file_exists(&resolved).await {
            return Err(not_found(format!(
                "file {} does not exist",
                resolved.display()
            )));
        }

        Ok(SyntheticModule::file(resolved))
    }

    /// Relative imports inside a facade point at the extension's directory.
    async fn sibling_of_facade(&self, request: &ModuleRequest) -> Option<SyntheticModule> {
        let hash = request
            .path
            .strip_prefix(HELPER_ROOT)?
            .strip_prefix('/')?
            .get(..32)?;
        let helper = self.known_hashes.get(hash)?;
        let extension = self.helpers.get(helper)?.extension.as_ref()?;

        let resolved = sibling_path(extension, &request.specifier);
        file_exists(&resolved)
            .await
            .then(|| SyntheticModule::file(resolved))
    }

    fn config(&self, helper: &str) -> Result<&HelperConfig> {
        self.helpers
            .get(helper)
            .ok_or_else(|| Error::Configuration(format!("Unknown helper {}", helper)))
    }
}

fn sibling_path(extension: &Path, name: &str) -> PathBuf {
    let directory = extension.parent().unwrap_or_else(|| Path::new("/"));
    let file = if name.ends_with(".js") {
        name.to_string()
    } else {
        format!("{}.js", name)
    };
    directory.join(file).normalize()
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Line-for-line map from the facade's leading lines to the extension file.
fn inline_source_map(file: &str, source_path: &Path, source: &str) -> String {
    let mappings = (0..source.lines().count())
        .map(|line| if line == 0 { "AAAA" } else { "AACA" })
        .collect::<Vec<_>>()
        .join(";");

    let map = serde_json::json!({
        "version": 3,
        "file": file,
        "sources": [source_path.to_string_lossy()],
        "sourcesContent": [source],
        "names": [],
        "mappings": mappings,
    });

    format!(
        "data:application/json;charset=utf-8;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(map.to_string())
    )
}
