use indexmap::IndexMap;

use super::{Resolution, SyntheticModule};
use crate::engine::ModuleRequest;

/// Virtual filename to literal module source, supplied per build.
pub type HypotheticalFiles = IndexMap<String, String>;

/// Serves caller-supplied fixtures. Only exact keys match.
pub struct HypotheticalFilesProvider {
    files: HypotheticalFiles,
}

impl HypotheticalFilesProvider {
    pub fn new(files: HypotheticalFiles) -> Self {
        Self { files }
    }

    pub fn handle(&self, request: &ModuleRequest) -> Option<Resolution> {
        let content = self.files.get(&request.specifier)?;
        let filename = if request.specifier.starts_with('/') {
            request.specifier.clone()
        } else {
            format!("/{}", request.specifier)
        };
        Some(Resolution::Module(SyntheticModule::virtual_file(
            filename,
            content.as_str(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HypotheticalFilesProvider {
        let mut files = HypotheticalFiles::new();
        files.insert("foo.js".into(), "export default 1;".into());
        files.insert("/abs/bar.js".into(), "export default 2;".into());
        HypotheticalFilesProvider::new(files)
    }

    #[test]
    fn test_exact_key_resolves() {
        let resolution = provider().handle(&ModuleRequest::new("foo.js", "/app"));
        assert_eq!(
            resolution,
            Some(Resolution::Module(SyntheticModule::virtual_file(
                "/foo.js",
                "export default 1;"
            )))
        );
    }

    #[test]
    fn test_absolute_key_keeps_its_path() {
        let Some(Resolution::Module(module)) =
            provider().handle(&ModuleRequest::new("/abs/bar.js", "/app"))
        else {
            panic!("expected module");
        };
        assert_eq!(module.filename, "/abs/bar.js");
    }

    #[test]
    fn test_nothing_else_resolves() {
        let provider = provider();
        for specifier in ["foo", "./foo.js", "/foo.js", "foo.js/", "FOO.js", "bar.js"] {
            assert!(
                provider.handle(&ModuleRequest::new(specifier, "/app")).is_none(),
                "{}",
                specifier
            );
        }
    }
}
