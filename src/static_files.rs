//! `GET /` and `GET /<file>` — static asset serving for the browser player,
//! with directory-traversal protection and a fixed extension-to-MIME table.

use std::path::{Component, Path as FsPath, PathBuf};

use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

const PUBLIC_DIR: &str = "public";

fn mime_type_for(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "html" => "text/html; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        _ => "application/octet-stream",
    }
}

/// Lexically resolves `requested` against the public root without touching
/// the filesystem, rejecting any path whose `..` components would walk above
/// the root. This lets traversal be rejected with `403` even when the target
/// doesn't exist, rather than leaking existence through a `404`.
fn resolve_within_root(requested: &str) -> Option<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in FsPath::new(requested).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Some(PathBuf::from(PUBLIC_DIR).join(resolved))
}

async fn serve(requested: &str) -> Response {
    let Some(full_path) = resolve_within_root(requested) else {
        warn!("rejected path traversal attempt: {}", requested);
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    };

    match tokio::fs::read(&full_path).await {
        Ok(body) => {
            let content_type = full_path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(mime_type_for)
                .unwrap_or("application/octet-stream");

            (
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                body,
            )
                .into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
        Err(e) => {
            error!("failed to read static asset {:?}: {}", full_path, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

pub async fn index_handler() -> Response {
    serve("index.html").await
}

pub async fn file_handler(Path(requested): Path<String>) -> Response {
    serve(&requested).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_plain_filenames_under_public() {
        let resolved = resolve_within_root("index.html").unwrap();
        assert_eq!(resolved, PathBuf::from("public/index.html"));
    }

    #[test]
    fn rejects_parent_dir_escape() {
        assert!(resolve_within_root("../etc/passwd").is_none());
        assert!(resolve_within_root("assets/../../etc/passwd").is_none());
    }

    #[test]
    fn allows_parent_dir_that_stays_within_root() {
        let resolved = resolve_within_root("assets/../index.html").unwrap();
        assert_eq!(resolved, PathBuf::from("public/index.html"));
    }

    #[test]
    fn mime_table_covers_the_fixed_extensions() {
        assert_eq!(mime_type_for("html"), "text/html; charset=utf-8");
        assert_eq!(mime_type_for("JS"), "application/javascript; charset=utf-8");
        assert_eq!(mime_type_for("css"), "text/css; charset=utf-8");
        assert_eq!(mime_type_for("json"), "application/json");
        assert_eq!(mime_type_for("png"), "image/png");
        assert_eq!(mime_type_for("svg"), "image/svg+xml");
        assert_eq!(mime_type_for("ico"), "image/x-icon");
        assert_eq!(mime_type_for("bin"), "application/octet-stream");
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let response = serve("this-file-does-not-exist.html").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn traversal_attempt_is_403() {
        let response = serve("../../../../etc/passwd").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
