use super::EXIT_SUCCESS;
use std::path::Path;
use testbed_schema::parse_config_file;

pub fn run(config_path: &Path) -> Result<u8, String> {
    let config = parse_config_file(config_path).map_err(|e| format!("configuration error: {e}"))?;
    println!("{}", super::json_pretty(&config)?);
    Ok(EXIT_SUCCESS)
}
