use crate::api::{ModelInfo, TagsResponse};
use crate::utils::url::construct_api_url;

/// Ask the runtime which models are installed.
pub async fn fetch_models(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<Vec<ModelInfo>, Box<dyn std::error::Error>> {
    let tags_url = construct_api_url(base_url, "api/tags");
    let response = client.get(tags_url).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(format!("model listing failed with status {status}: {error_text}").into());
    }

    let tags = response.json::<TagsResponse>().await?;
    let mut models = tags.models;
    sort_models(&mut models);
    Ok(models)
}

/// Sort models most-recently-modified first, falling back to name order so
/// runtimes that omit timestamps still list deterministically.
pub fn sort_models(models: &mut [ModelInfo]) {
    models.sort_by(|a, b| match (&a.modified_at, &b.modified_at) {
        (Some(a_modified), Some(b_modified)) => b_modified.cmp(a_modified),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.name.cmp(&b.name),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str, modified_at: Option<&str>) -> ModelInfo {
        ModelInfo {
            name: name.to_string(),
            modified_at: modified_at.map(str::to_string),
            size: None,
        }
    }

    #[test]
    fn newest_models_sort_first() {
        let mut models = vec![
            model("old", Some("2024-01-01T00:00:00Z")),
            model("new", Some("2025-06-01T00:00:00Z")),
            model("undated", None),
        ];
        sort_models(&mut models);
        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["new", "old", "undated"]);
    }

    #[test]
    fn undated_models_fall_back_to_name_order() {
        let mut models = vec![model("zeta", None), model("alpha", None)];
        sort_models(&mut models);
        assert_eq!(models[0].name, "alpha");
    }
}
