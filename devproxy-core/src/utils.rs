use http::{HeaderMap, HeaderName, Uri, header};

/// Headers scoped to a single connection, never forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Joins a base path and a request path with exactly one `/` between them.
///
/// An empty result is normalized to `/`.
///
/// # Examples
///
/// ```
/// use devproxy_core::utils::join_paths;
///
/// assert_eq!(join_paths("/", "/api/users"), "/api/users");
/// assert_eq!(join_paths("/v1/", "users"), "/v1/users");
/// assert_eq!(join_paths("/", ""), "/");
/// ```
pub fn join_paths(base: &str, path: &str) -> String {
    let base_trimmed = base.trim_end_matches('/');
    let path_trimmed = path.trim_start_matches('/');

    format!("{}/{}", base_trimmed, path_trimmed)
}

/// Combines a target URI with a rewritten path and the original query.
///
/// Scheme and authority come from `base`, the path is `base`'s path joined
/// with `path`, and `query` is appended untouched.
pub fn combine_uris(base: &Uri, path: &str, query: Option<&str>) -> Result<Uri, http::Error> {
    let mut full_path = join_paths(base.path(), path);

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        full_path.push('?');
        full_path.push_str(query);
    }

    if let Some(scheme) = base.scheme_str() {
        let authority = base.authority().map(|a| a.as_str()).unwrap_or("");

        full_path = format!("{}://{}{}", scheme, authority, full_path);
    }
    Ok(full_path.parse::<Uri>()?)
}

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}
