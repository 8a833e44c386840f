//! Default handling for requests no proxy rule claims.

use std::path::{Component, Path, PathBuf};

use http::{Method, Response, StatusCode, header};
use http_body_util::{BodyExt as _, Empty, Full};
use hyper::body::Bytes;
use tracing::{debug, warn};

use crate::service::ProxyBody;

/// Serves files from a directory the way a front-end dev server does.
#[derive(Debug, Clone, Default)]
pub struct StaticFiles {
    root: Option<PathBuf>,
    history_fallback: bool,
}

impl StaticFiles {
    pub fn new(root: Option<PathBuf>, history_fallback: bool) -> Self {
        Self {
            root,
            history_fallback,
        }
    }

    /// Maps a request path onto a file below `root`.
    ///
    /// Returns `None` when the decoded path tries to leave `root`.
    fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(request_path).ok()?;
        let mut resolved = root.to_path_buf();

        for component in Path::new(decoded.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(resolved)
    }

    /// Answers `method path` from disk.
    pub async fn serve(&self, method: &Method, path: &str) -> Response<ProxyBody> {
        let Some(root) = self.root.as_deref() else {
            debug!("No static root configured, {} not found", path);
            return status_response(StatusCode::NOT_FOUND);
        };

        if method != Method::GET && method != Method::HEAD {
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        let Some(mut file) = Self::resolve(root, path) else {
            warn!("Rejected static path outside of root: {}", path);
            return status_response(StatusCode::FORBIDDEN);
        };

        if tokio::fs::metadata(&file)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            file.push("index.html");
        }

        debug!("Attempting to serve static file: {}", file.display());

        match tokio::fs::read(&file).await {
            Ok(contents) => file_response(method, &file, contents),
            Err(_) if self.history_fallback => {
                let index = root.join("index.html");
                match tokio::fs::read(&index).await {
                    Ok(contents) => {
                        debug!("File not found, serving index.html for history fallback");
                        file_response(method, &index, contents)
                    }
                    Err(_) => status_response(StatusCode::NOT_FOUND),
                }
            }
            Err(_) => {
                debug!("Static file not found: {}", file.display());
                status_response(StatusCode::NOT_FOUND)
            }
        }
    }
}

fn file_response(method: &Method, file: &Path, contents: Vec<u8>) -> Response<ProxyBody> {
    let mime_type = mime_guess::from_path(file)
        .first_or_octet_stream()
        .to_string();
    let length = contents.len();

    let body = if method == Method::HEAD {
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed()
    } else {
        Full::<Bytes>::from(contents)
            .map_err(|never| match never {})
            .boxed()
    };

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        mime_type
            .parse()
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, length.into());
    headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    response
}

/// Empty response carrying only a status code.
pub(crate) fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}
