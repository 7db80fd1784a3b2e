use super::{ConfigError, OrchestrationSettings};
use std::path::Path;

pub fn load_settings(path: &Path) -> Result<OrchestrationSettings, ConfigError> {
    let settings = OrchestrationSettings::from_path(path)?;
    settings.validate()?;
    Ok(settings)
}
