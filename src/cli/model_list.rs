use std::error::Error;

use crate::api::models::fetch_models;

/// Print the models installed on the runtime, newest first.
pub async fn list_models(client: &reqwest::Client, base_url: &str) -> Result<(), Box<dyn Error>> {
    let models = fetch_models(client, base_url).await?;

    if models.is_empty() {
        println!("No models installed on {base_url}.");
        return Ok(());
    }

    println!("Models on {base_url}:");
    for model in models {
        match model.size {
            Some(size) => println!("  {:<40} {}", model.name, format_size(size)),
            None => println!("  {}", model.name),
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.0} MB", bytes as f64 / MB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_render_in_sensible_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_size(4_800_000_000), "4.5 GB");
    }
}
