//! Tool-call and discovery commands for the façade layer.
//!
//! These never surface a raw transport error: every outcome becomes a
//! serializable response the façade can return as-is.

use serde::Serialize;

use crate::worker_client::{ResourceDescriptor, Session, ToolDescriptor};

// ─── Response Types ─────────────────────────────────────────────────────────

/// Outcome of one tool call, as returned to the façade's clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub success: bool,
    pub content: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resources the worker advertises.
#[derive(Debug, Clone, Serialize)]
pub struct ResourcesResponse {
    pub resources: Vec<ResourceDescriptor>,
}

/// Tools the worker advertises.
#[derive(Debug, Clone, Serialize)]
pub struct ToolsResponse {
    pub tools: Vec<ToolDescriptor>,
}

// ─── Commands ───────────────────────────────────────────────────────────────

/// Call a tool and normalize the outcome.
///
/// A tool that reports `isError` keeps its content (it usually explains the
/// failure); a failed call carries the error text and no content.
pub async fn call_tool(
    session: &Session,
    tool_name: &str,
    arguments: serde_json::Value,
) -> ToolResponse {
    match session.call_tool(tool_name, arguments).await {
        Ok(result) if result.is_error => ToolResponse {
            success: false,
            content: result.content,
            error: Some("Tool execution failed".to_string()),
        },
        Ok(result) => ToolResponse {
            success: true,
            content: result.content,
            error: None,
        },
        Err(e) => {
            tracing::error!(tool = tool_name, error = %e, "tool call failed");
            ToolResponse {
                success: false,
                content: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

/// List tools. Unlike resources, a failure is reported to the caller.
pub async fn list_tools(session: &Session) -> Result<ToolsResponse, String> {
    session
        .list_tools()
        .await
        .map(|tools| ToolsResponse { tools })
        .map_err(|e| format!("{e}"))
}

/// List resources. Always succeeds; failures yield an empty list.
pub async fn list_resources(session: &Session) -> ResourcesResponse {
    ResourcesResponse {
        resources: session.list_resources().await,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    #[test]
    fn test_tool_response_omits_missing_error() {
        let resp = ToolResponse {
            success: true,
            content: vec![serde_json::json!({"type": "text", "text": "ok"})],
            error: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["content"][0]["text"], "ok");
    }

    #[tokio::test]
    async fn test_call_tool_on_unstarted_session_is_structured_failure() {
        let session = Session::new(BridgeConfig::default());
        let resp = call_tool(&session, "puppeteer_navigate", serde_json::json!({"url": "x"})).await;
        assert!(!resp.success);
        assert!(resp.content.is_empty());
        assert!(resp.error.unwrap().contains("not initialized"));
    }

    #[tokio::test]
    async fn test_list_resources_never_fails() {
        let session = Session::new(BridgeConfig::default());
        assert!(list_resources(&session).await.resources.is_empty());
    }

    #[tokio::test]
    async fn test_list_tools_reports_failure() {
        let session = Session::new(BridgeConfig::default());
        assert!(list_tools(&session).await.is_err());
    }
}
