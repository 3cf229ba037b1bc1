//! API call command handler.

use std::collections::BTreeMap;

use devauth::config::DevauthConfig;
use devauth::Result;

/// Handle the `devauth call <method> [key=value...]` command.
pub async fn handle_call(
    config: &DevauthConfig,
    method: &str,
    params: Vec<(String, String)>,
    raw: bool,
) -> Result<()> {
    let mut session = config.session()?;

    if raw {
        let response = session.call_raw(method, params).await?;
        println!("HTTP {}", response.status);
        println!("{}", response.body);
        return Ok(());
    }

    let params: BTreeMap<String, String> = params.into_iter().collect();
    let result = session.invoke(method, &params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
