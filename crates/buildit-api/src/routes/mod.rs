//! API routes.

pub mod health;
pub mod jobs;
pub mod queue;

use crate::AppState;
use crate::error::ApiError;
use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use buildit_core::FullName;
use buildit_core::security::Permission;
use serde::Serialize;

/// Header carrying the authenticated user name.
pub const USER_HEADER: &str = "x-buildit-user";

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/json", get(jobs::root_index))
        .route("/createItem", post(jobs::create_root_item))
        .route("/job/{*path}", get(jobs::get_job).post(jobs::post_job))
        .route("/queue/item/{id}", get(queue::get_item))
        .route("/queue/item/{id}/", get(queue::get_item))
        .route("/queue/item/{id}/cancel", post(queue::cancel_item))
        .merge(health::router())
        .with_state(state)
}

/// User named by the request, `None` for anonymous requests.
pub(crate) fn request_user(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// URL of an item, e.g. `/job/folder/job/app/`.
pub fn job_url(name: &FullName) -> String {
    let mut url = String::new();
    for segment in name.segments() {
        url.push_str("/job/");
        url.push_str(segment);
    }
    url.push('/');
    url
}

/// Split `a/job/b/api/json` into the item name `a/b` and the action
/// segments `["api", "json"]`.
pub fn parse_job_path(path: &str) -> Option<(String, Vec<String>)> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let mut names = vec![segments.next()?];
    let mut rest: Vec<&str> = segments.collect();
    while rest.len() >= 2 && rest[0] == "job" {
        names.push(rest[1]);
        rest.drain(..2);
    }
    Some((
        names.join("/"),
        rest.into_iter().map(str::to_string).collect(),
    ))
}

/// Items the user cannot read look the same as missing ones.
pub(crate) fn require_read(
    state: &AppState,
    user: Option<&str>,
    name: &FullName,
) -> Result<(), ApiError> {
    if state.scheduler.has_permission(user, Permission::Read, name) {
        return Ok(());
    }
    Err(ApiError::NotFound(format!("No such item: {name}")))
}

pub(crate) fn require(
    state: &AppState,
    user: Option<&str>,
    permission: Permission,
    name: &FullName,
) -> Result<(), ApiError> {
    buildit_core::security::require(state.scheduler.authorizer(), user, permission, name)?;
    Ok(())
}

/// Reference to an item in responses.
#[derive(Debug, Clone, Serialize)]
pub struct ItemRef {
    pub name: String,
    pub url: String,
}

impl From<&FullName> for ItemRef {
    fn from(name: &FullName) -> Self {
        Self {
            name: name.to_string(),
            url: job_url(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_path() {
        assert_eq!(
            parse_job_path("a/job/b/api/json"),
            Some(("a/b".to_string(), vec!["api".to_string(), "json".to_string()]))
        );
        assert_eq!(parse_job_path("app/"), Some(("app".to_string(), vec![])));
        assert_eq!(
            parse_job_path("app/build"),
            Some(("app".to_string(), vec!["build".to_string()]))
        );
        assert_eq!(
            parse_job_path("app/job"),
            Some(("app".to_string(), vec!["job".to_string()]))
        );
        assert_eq!(parse_job_path(""), None);
    }

    #[test]
    fn test_job_url() {
        let name = FullName::parse("d/sub/app").unwrap();
        assert_eq!(job_url(&name), "/job/d/job/sub/job/app/");
    }

    #[test]
    fn test_request_user() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_user(&headers), None);
        headers.insert(USER_HEADER, "alice".parse().unwrap());
        assert_eq!(request_user(&headers), Some("alice".to_string()));
    }
}
