//! ML Python runtime.
//!
//! Composition over the base Python adapter: a separate image preloaded
//! with numeric libraries, an optional deterministic-seed and verbose
//! logging prelude, a curated install allow-list, and telemetry parsing
//! from stderr.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::engine::Engine;
use crate::error::{Result, SandboxError};
use crate::runtime::execute::{ExecContext, ExecutionOutcome};
use crate::runtime::install::InstallResult;
use crate::runtime::{Language, RuntimeAdapter};

/// Image preloaded with the numeric/ML stack.
pub const ML_PYTHON_IMAGE: &str = "execbox-python-ml:latest";

/// Telemetry token prefix recognized on stderr lines.
const METRIC_PREFIX: &str = "EXECBOX_METRIC:";

/// Libraries installable in the ML runtime.
const ML_ALLOWED_PACKAGES: &[&str] = &[
    "numpy",
    "pandas",
    "scipy",
    "scikit-learn",
    "torch",
    "torchvision",
    "tensorflow",
    "keras",
    "jax",
    "transformers",
    "datasets",
    "tokenizers",
    "matplotlib",
    "seaborn",
    "xgboost",
    "lightgbm",
    "statsmodels",
    "pillow",
    "opencv-python-headless",
    "onnxruntime",
];

/// Well-known telemetry values parsed from stderr.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_load_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_ms: Option<f64>,
    /// Any other reported metrics, keyed by token name
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, f64>,
}

impl ExecMetrics {
    fn is_empty(&self) -> bool {
        self.peak_memory_mb.is_none()
            && self.model_load_ms.is_none()
            && self.inference_ms.is_none()
            && self.extra.is_empty()
    }
}

/// Behavior switches for the ML runtime.
#[derive(Debug, Clone, Default)]
pub struct MlOptions {
    /// Prepend deterministic-seed setup to every snippet
    pub deterministic: bool,
    /// Prepend verbose library logging setup
    pub verbose: bool,
}

/// Python runtime specialized for ML workloads.
pub struct MlRuntime {
    base: RuntimeAdapter,
    options: MlOptions,
}

impl MlRuntime {
    pub fn new(options: MlOptions) -> Self {
        Self {
            base: RuntimeAdapter::with_image(Language::Python, ML_PYTHON_IMAGE),
            options,
        }
    }

    /// The underlying adapter, for image and language queries.
    pub fn adapter(&self) -> &RuntimeAdapter {
        &self.base
    }

    /// Execute a snippet, delegating to the base Python adapter and parsing
    /// telemetry tokens out of stderr.
    ///
    /// # Errors
    ///
    /// Same contract as [`RuntimeAdapter::execute`].
    pub async fn execute(
        &self,
        engine: &Engine,
        container_id: &str,
        source: &str,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome> {
        let source = self.prepare_source(source);
        let mut outcome = self.base.execute(engine, container_id, &source, ctx).await?;

        let metrics = parse_telemetry(&outcome.stderr);
        if !metrics.is_empty() {
            debug!("Parsed ML telemetry: {:?}", metrics);
            outcome.metrics = Some(metrics);
        }
        Ok(outcome)
    }

    /// Install packages, restricted to the curated ML allow-list.
    ///
    /// # Errors
    ///
    /// Returns a security error naming the first package outside the
    /// allow-list; otherwise the base install contract applies.
    pub async fn install_packages(
        &self,
        engine: &Engine,
        container_id: &str,
        packages: &[String],
    ) -> Result<InstallResult> {
        validate_ml_packages(packages)?;

        self.base
            .install_packages(engine, container_id, packages)
            .await
    }

    fn prepare_source(&self, source: &str) -> String {
        let mut prelude = String::new();

        if self.options.deterministic {
            prelude.push_str(concat!(
                "import random\n",
                "random.seed(0)\n",
                "try:\n",
                "    import numpy as _np\n",
                "    _np.random.seed(0)\n",
                "except ImportError:\n",
                "    pass\n",
                "try:\n",
                "    import torch as _torch\n",
                "    _torch.manual_seed(0)\n",
                "except ImportError:\n",
                "    pass\n",
            ));
        }
        if self.options.verbose {
            prelude.push_str(concat!(
                "import logging\n",
                "logging.basicConfig(level=logging.DEBUG)\n",
            ));
        }

        if prelude.is_empty() {
            source.to_string()
        } else {
            format!("{prelude}\n{source}")
        }
    }
}

/// Reject any package whose base name is outside the curated ML list.
pub fn validate_ml_packages(packages: &[String]) -> Result<()> {
    for package in packages {
        let base = package
            .split(['=', '>', '<', '~', '['])
            .next()
            .unwrap_or(package)
            .trim()
            .to_lowercase();
        if !ML_ALLOWED_PACKAGES.contains(&base.as_str()) {
            return Err(SandboxError::Security(
                crate::security::SecurityError::BlockedPackage(format!(
                    "{package} is not on the ML allow-list"
                )),
            ));
        }
    }
    Ok(())
}

/// Parse `EXECBOX_METRIC:<key>=<value>` tokens from stderr.
pub fn parse_telemetry(stderr: &str) -> ExecMetrics {
    let mut metrics = ExecMetrics::default();

    for line in stderr.lines() {
        let Some(rest) = line.trim().strip_prefix(METRIC_PREFIX) else {
            continue;
        };
        let Some((key, value)) = rest.split_once('=') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<f64>() else {
            continue;
        };

        match key.trim() {
            "peak_memory_mb" => metrics.peak_memory_mb = Some(value),
            "model_load_ms" => metrics.model_load_ms = Some(value),
            "inference_ms" => metrics.inference_ms = Some(value),
            other => {
                metrics.extra.insert(other.to_string(), value);
            }
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_tokens() {
        let stderr = "\
loading model
EXECBOX_METRIC:peak_memory_mb=512.5
EXECBOX_METRIC:model_load_ms=1250
EXECBOX_METRIC:inference_ms=33.4
done";
        let metrics = parse_telemetry(stderr);
        assert_eq!(metrics.peak_memory_mb, Some(512.5));
        assert_eq!(metrics.model_load_ms, Some(1250.0));
        assert_eq!(metrics.inference_ms, Some(33.4));
        assert!(metrics.extra.is_empty());
    }

    #[test]
    fn test_parse_unknown_tokens_land_in_extra() {
        let metrics = parse_telemetry("EXECBOX_METRIC:tokens_per_s=42.0");
        assert_eq!(metrics.extra["tokens_per_s"], 42.0);
    }

    #[test]
    fn test_parse_ignores_garbage() {
        let metrics = parse_telemetry("EXECBOX_METRIC:peak_memory_mb=not-a-number\nplain line");
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_allow_list_blocks_off_list_package() {
        let result = validate_ml_packages(&["requests".to_string()]);
        assert!(matches!(result, Err(SandboxError::Security(_))));
    }

    #[test]
    fn test_allow_list_accepts_versioned_ml_packages() {
        assert!(validate_ml_packages(&["numpy==1.26.4".to_string()]).is_ok());
        assert!(validate_ml_packages(&["Torch>=2.0".to_string()]).is_ok());
        assert!(validate_ml_packages(&["scikit-learn".to_string()]).is_ok());
    }

    #[test]
    fn test_deterministic_prelude_prepended() {
        let runtime = MlRuntime::new(MlOptions {
            deterministic: true,
            verbose: false,
        });
        let prepared = runtime.prepare_source("print(1)");
        assert!(prepared.starts_with("import random"));
        assert!(prepared.contains("manual_seed(0)"));
        assert!(prepared.ends_with("print(1)"));
    }

    #[test]
    fn test_no_prelude_without_options() {
        let runtime = MlRuntime::new(MlOptions::default());
        assert_eq!(runtime.prepare_source("print(1)"), "print(1)");
    }
}
