use std::env;

use serde::{Deserialize, Serialize};

const DEFAULT_WORKER_THREAD: &str = "media-plugin-worker";
const DEFAULT_CONTROL_THREAD: &str = "media-plugin-control";

/// Runtime configuration for the media plugin service.
///
/// `Default` honours the `HARMONIQ_MEDIA_*` environment overrides so the
/// service can be tuned without recompiling the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Name given to the dedicated worker thread.
    pub worker_thread_name: String,
    /// Name given to the control thread that constructs the service.
    pub control_thread_name: String,
    /// Refuse decryptor requests when the platform cannot sandbox media plugins.
    pub require_media_sandbox: bool,
    pub app_version: Option<String>,
    pub build_id: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            worker_thread_name: env::var("HARMONIQ_MEDIA_WORKER_NAME")
                .unwrap_or_else(|_| DEFAULT_WORKER_THREAD.to_owned()),
            control_thread_name: env::var("HARMONIQ_MEDIA_CONTROL_NAME")
                .unwrap_or_else(|_| DEFAULT_CONTROL_THREAD.to_owned()),
            require_media_sandbox: env::var("HARMONIQ_MEDIA_REQUIRE_SANDBOX")
                .map(|value| parse_flag(&value))
                .unwrap_or(true),
            app_version: env::var("HARMONIQ_APP_VERSION").ok(),
            build_id: env::var("HARMONIQ_BUILD_ID").ok(),
        }
    }
}

impl BrokerConfig {
    pub fn with_worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.worker_thread_name = name.into();
        self
    }

    pub fn with_control_thread_name(mut self, name: impl Into<String>) -> Self {
        self.control_thread_name = name.into();
        self
    }

    pub fn with_require_media_sandbox(mut self, required: bool) -> Self {
        self.require_media_sandbox = required;
        self
    }

    pub fn with_app_identity(
        mut self,
        version: impl Into<String>,
        build_id: impl Into<String>,
    ) -> Self {
        self.app_version = Some(version.into());
        self.build_id = Some(build_id.into());
        self
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
