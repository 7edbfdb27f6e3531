//! HTTP middleware hooks. These run for every gateway request, so they carry
//! no target and only server, tenant and user conditions apply to them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Hook, HookFuture, HookType};
use crate::plugin::base::Plugin;
use crate::plugin::schema::PluginContext;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpPreRequestPayload {
    pub path: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpPostRequestPayload {
    pub path: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl HttpPostRequestPayload {
    /// Builds the post-request payload from its pre-request counterpart.
    pub fn from_request(request: HttpPreRequestPayload, status_code: Option<u16>) -> Self {
        Self {
            path: request.path,
            method: request.method,
            client_host: request.client_host,
            client_port: request.client_port,
            headers: request.headers,
            response_headers: None,
            status_code,
        }
    }
}

pub struct HttpPreRequest;

impl Hook for HttpPreRequest {
    type Payload = HttpPreRequestPayload;

    fn hook_type() -> HookType {
        HookType::HTTP_PRE_REQUEST
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        plugin.http_pre_request(payload, context)
    }
}

pub struct HttpPostRequest;

impl Hook for HttpPostRequest {
    type Payload = HttpPostRequestPayload;

    fn hook_type() -> HookType {
        HookType::HTTP_POST_REQUEST
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        plugin.http_post_request(payload, context)
    }
}
