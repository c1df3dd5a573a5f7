use std::{env, path::PathBuf, str::FromStr};

use thiserror::Error;

const MAX_IMAGE_SIZE: u32 = 4096;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} has an invalid value: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Runtime settings for the service. Defaults: port 8080, a 10 MiB form
/// limit, `uploads/` and an `efficientnet/` SavedModel next to the binary.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub upload_dir: PathBuf,
    pub model_dir: PathBuf,
    pub model_tag: String,
    pub input_tensor: String,
    pub output_tensor: String,
    pub image_size: u32,
    pub keep_uploads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            body_limit_bytes: 10 * 1024 * 1024,
            upload_dir: PathBuf::from("uploads"),
            model_dir: PathBuf::from("efficientnet"),
            model_tag: "serve".to_string(),
            input_tensor: "input_1".to_string(),
            output_tensor: "probs".to_string(),
            image_size: 224,
            keep_uploads: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds a config from an arbitrary variable source, falling back to
    /// the defaults for anything unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let body_limit_mb: usize = parse_or(&lookup, "BODY_LIMIT_MB", 10)?;
        let body_limit_bytes = body_limit_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| ConfigError::Invalid {
                var: "BODY_LIMIT_MB",
                value: body_limit_mb.to_string(),
            })?;

        let image_size: u32 = parse_or(&lookup, "IMAGE_SIZE", defaults.image_size)?;
        if image_size == 0 || image_size > MAX_IMAGE_SIZE {
            return Err(ConfigError::Invalid {
                var: "IMAGE_SIZE",
                value: image_size.to_string(),
            });
        }

        Ok(Config {
            port: parse_or(&lookup, "PORT", defaults.port)?,
            body_limit_bytes,
            upload_dir: lookup("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            model_dir: lookup("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            model_tag: lookup("MODEL_TAG").unwrap_or(defaults.model_tag),
            input_tensor: lookup("INPUT_TENSOR").unwrap_or(defaults.input_tensor),
            output_tensor: lookup("OUTPUT_TENSOR").unwrap_or(defaults.output_tensor),
            image_size,
            keep_uploads: parse_flag(&lookup, "KEEP_UPLOADS", defaults.keep_uploads)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn parse_flag<F>(lookup: &F, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { var, value }),
        },
    }
}
