//! Pipeline-side definitions
//!
//! This module contains what a pipeline author and operator declare:
//! - `deploy_step` - The deploy step definition and gate id derivation
//! - `parameter` - Declared input parameters and form parsing
//! - `request` - Submitted parameters and the deploy request built from them
//! - `config` - Callback URLs, HTTP pool policy and security table

pub mod config;
pub mod deploy_step;
pub mod parameter;
pub mod request;

pub use config::{ConfigError, GateConfig, HttpConfig};
pub use deploy_step::{capitalize, digest_of, DeployStep, DEFAULT_MESSAGE, DEFAULT_OK};
pub use parameter::{parse_form, ParameterDefinition};
pub use request::{is_deploy_request, params_value, DeployRequest, Params, DEPLOY_FIELD};
