//! Dockerfile recipe generation.
//!
//! Renders the text an external image builder would use to bake a
//! language image, optionally with packages preinstalled. Not required at
//! runtime; the MCP surface exposes it for operators provisioning hosts.

use crate::runtime::{Language, RuntimeAdapter};

impl RuntimeAdapter {
    /// Render a Dockerfile for this language, optionally preinstalling
    /// `packages`.
    pub fn build_image_recipe(&self, packages: &[String]) -> String {
        let mut recipe = String::new();
        recipe.push_str(&format!("FROM {}\n\n", self.image()));

        // Sandbox user mirrors the hardening profile's run-as user
        recipe.push_str(match self.language() {
            Language::Bash | Language::Go => {
                "RUN adduser -D -u 1000 sandbox 2>/dev/null || true\n"
            }
            _ => "RUN useradd -m -u 1000 sandbox 2>/dev/null || true\n",
        });
        recipe.push_str("RUN mkdir -p /workspace && chown 1000:1000 /workspace\n\n");

        match self.language() {
            Language::Python => {
                if !packages.is_empty() {
                    recipe.push_str(&format!(
                        "RUN pip install --no-cache-dir {}\n",
                        packages.join(" ")
                    ));
                }
            }
            Language::TypeScript => {
                recipe.push_str("RUN npm install -g typescript tsx\n");
                if !packages.is_empty() {
                    recipe.push_str(&format!(
                        "RUN cd /workspace && npm install --no-save {}\n",
                        packages.join(" ")
                    ));
                }
            }
            Language::JavaScript => {
                if !packages.is_empty() {
                    recipe.push_str(&format!(
                        "RUN cd /workspace && npm install --no-save {}\n",
                        packages.join(" ")
                    ));
                }
            }
            Language::Go => {
                recipe.push_str("RUN cd /workspace && go mod init sandbox\n");
                for package in packages {
                    recipe.push_str(&format!("RUN cd /workspace && go get {package}\n"));
                }
            }
            Language::Rust => {
                recipe.push_str("RUN cd /workspace && cargo init --name sandbox .\n");
                for package in packages {
                    recipe.push_str(&format!("RUN cd /workspace && cargo add {package}\n"));
                }
            }
            Language::Bash => {
                if !packages.is_empty() {
                    recipe.push_str(&format!(
                        "RUN apk update && apk add --no-cache {}\n",
                        packages.join(" ")
                    ));
                }
            }
        }

        recipe.push_str("\nUSER 1000:1000\nWORKDIR /workspace\nCMD [\"sleep\", \"infinity\"]\n");
        recipe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_recipe() {
        let adapter = RuntimeAdapter::for_language(Language::Python);
        let recipe = adapter.build_image_recipe(&["requests".to_string(), "numpy".to_string()]);

        assert!(recipe.starts_with("FROM python:3.12-slim\n"));
        assert!(recipe.contains("pip install --no-cache-dir requests numpy"));
        assert!(recipe.contains("USER 1000:1000"));
        assert!(recipe.contains("WORKDIR /workspace"));
    }

    #[test]
    fn test_typescript_recipe_installs_runner() {
        let adapter = RuntimeAdapter::for_language(Language::TypeScript);
        let recipe = adapter.build_image_recipe(&[]);
        assert!(recipe.contains("npm install -g typescript tsx"));
    }

    #[test]
    fn test_go_recipe_initializes_module() {
        let adapter = RuntimeAdapter::for_language(Language::Go);
        let recipe = adapter.build_image_recipe(&["github.com/gorilla/mux".to_string()]);
        assert!(recipe.contains("go mod init sandbox"));
        assert!(recipe.contains("go get github.com/gorilla/mux"));
    }

    #[test]
    fn test_empty_packages_still_valid() {
        for language in Language::ALL {
            let recipe = RuntimeAdapter::for_language(language).build_image_recipe(&[]);
            assert!(recipe.starts_with("FROM "));
            assert!(recipe.ends_with("CMD [\"sleep\", \"infinity\"]\n"));
        }
    }
}
