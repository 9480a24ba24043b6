// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Shared pieces of the adpass workspace: ledger wire types, duration
//! parsing for configuration, and logging setup.

pub mod api;
pub mod duration;

pub mod logging {
    use std::sync::Once;
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{fmt, EnvFilter};

    static INIT: Once = Once::new();

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LogFormat {
        Plain,
        Json,
    }

    impl LogFormat {
        /// `LOG_FORMAT=json` selects JSON; anything else is plain.
        pub fn from_env() -> Self {
            match std::env::var("LOG_FORMAT") {
                Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Plain,
            }
        }
    }

    fn env_filter(default_filter: &str) -> EnvFilter {
        EnvFilter::try_from_env("RUST_LOG")
            .or_else(|_| EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::INFO.into()))
    }

    /// Install the global tracing subscriber once per process.
    ///
    /// Env:
    /// - RUST_LOG   (e.g., "info,adpass_client=debug,reqwest=warn")
    /// - LOG_FORMAT ("plain" [default] | "json")
    ///
    /// `default_filter` applies when RUST_LOG is unset. Later calls are no-ops,
    /// as is a call made after another subscriber was installed.
    pub fn init(default_filter: &str) {
        INIT.call_once(|| {
            let builder = fmt()
                .with_env_filter(env_filter(default_filter))
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_target(true);

            let installed = match LogFormat::from_env() {
                LogFormat::Json => builder
                    .json()
                    .with_current_span(false)
                    .with_ansi(false)
                    .try_init()
                    .is_ok(),
                LogFormat::Plain => builder.with_ansi(cfg!(unix)).try_init().is_ok(),
            };

            if installed {
                tracing::debug!(default_filter, "logging initialized");
            }
        });
    }
}
