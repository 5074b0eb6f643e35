//! Release update check.

use tracing::warn;

/// Query the releases URL with redirects disabled. Only a 302 response
/// carrying a Location header is treated as an answer: its last path
/// segment is compared against `v<version>`. Every other outcome,
/// including transport errors, reports no update. This reproduces the
/// original check exactly; see DESIGN.md.
pub async fn check_update(release_url: &str, version: &str) -> (bool, String) {
    let client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!("update check: {}", err);
            return (false, String::new());
        }
    };

    let response = match client.get(release_url).send().await {
        Ok(response) => response,
        Err(_) => return (false, String::new()),
    };

    if response.status() != reqwest::StatusCode::FOUND {
        return (false, String::new());
    }

    let location = match response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|value| value.to_str().ok())
    {
        Some(location) => location,
        None => return (false, String::new()),
    };

    let latest = location.rsplit('/').next().unwrap_or("");
    if latest == format!("v{}", version) {
        return (false, String::new());
    }

    (true, latest.to_string())
}
