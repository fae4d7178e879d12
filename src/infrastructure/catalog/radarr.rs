use async_trait::async_trait;
use serde::Serialize;

use super::http::ApiClient;
use super::{Command, Movie, RadarrClient};
use crate::config::settings::CatalogEndpoint;
use crate::modules::transcode::policy::VideoFile;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RescanMovie {
    name: &'static str,
    movie_id: i64,
}

#[derive(Clone)]
pub struct HttpRadarrClient {
    api: ApiClient,
}

impl HttpRadarrClient {
    pub fn new(endpoint: &CatalogEndpoint) -> anyhow::Result<Self> {
        Ok(Self {
            api: ApiClient::new(endpoint)?,
        })
    }
}

#[async_trait]
impl RadarrClient for HttpRadarrClient {
    async fn lookup_media_file(&self, movie_id: i64) -> anyhow::Result<Option<VideoFile>> {
        let movie: Option<Movie> = self.api.get_optional(&format!("movie/{movie_id}"), &[]).await?;
        Ok(movie.and_then(|m| m.video_file()))
    }

    async fn list_movies(&self) -> anyhow::Result<Vec<Movie>> {
        self.api.get("movie", &[]).await
    }

    async fn rescan(&self, movie_id: i64) -> anyhow::Result<Command> {
        let body = RescanMovie {
            name: "RescanMovie",
            movie_id,
        };
        self.api.post("command", &body).await
    }

    async fn command_status(&self, command_id: i64) -> anyhow::Result<Command> {
        self.api.get(&format!("command/{command_id}"), &[]).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};

    use super::*;
    use crate::infrastructure::catalog::http::testing::{API_KEY, serve};

    fn authorized(query: &HashMap<String, String>) -> bool {
        query.get("apikey").map(String::as_str) == Some(API_KEY)
    }

    fn radarr() -> Router {
        Router::new()
            .route(
                "/api/movie/{id}",
                get(|Path(id): Path<i64>, Query(q): Query<HashMap<String, String>>| async move {
                    if !authorized(&q) {
                        return Err(StatusCode::UNAUTHORIZED);
                    }
                    if id != 3 {
                        return Err(StatusCode::NOT_FOUND);
                    }
                    Ok(Json(json!({
                        "id": 3,
                        "path": "/movies/Heat",
                        "downloaded": true,
                        "movieFile": { "relativePath": "Heat.avi", "mediaInfo": { "videoFormat": "XviD" } }
                    })))
                }),
            )
            .route(
                "/api/command",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({ "id": 90, "name": body["name"], "state": format!("queued:{}", body["movieId"]) }))
                }),
            )
            .route(
                "/api/command/{id}",
                get(|Path(id): Path<i64>| async move { Json(json!({ "id": id, "state": "completed" })) }),
            )
    }

    #[tokio::test]
    async fn looks_up_the_movie_file() {
        let client = HttpRadarrClient::new(&serve(radarr()).await).unwrap();

        let file = client.lookup_media_file(3).await.unwrap().unwrap();
        assert_eq!(file.file_path, std::path::Path::new("/movies/Heat/Heat.avi"));
        assert_eq!(file.video_codec, "XviD");

        assert!(client.lookup_media_file(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rescan_posts_the_movie_command() {
        let client = HttpRadarrClient::new(&serve(radarr()).await).unwrap();

        let cmd = client.rescan(3).await.unwrap();
        assert_eq!(cmd.id, 90);
        assert_eq!(cmd.name, "RescanMovie");
        assert_eq!(cmd.state, "queued:3");

        assert!(client.command_status(90).await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn wrong_api_key_is_an_error() {
        let mut endpoint = serve(radarr()).await;
        endpoint.api_key = "nope".to_string();
        let client = HttpRadarrClient::new(&endpoint).unwrap();

        assert!(client.lookup_media_file(3).await.is_err());
    }
}
