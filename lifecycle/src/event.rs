use anyhow::{Context, Result};
use serde::Deserialize;

/// A termination lifecycle event as delivered by the scaling layer.
#[derive(Clone, Debug)]
pub struct LifecycleEvent {
    pub instance_id: String,
    pub hook_name: String,
    pub group_name: String,
    pub action_token: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    detail: Detail,
}

#[derive(Deserialize)]
struct Detail {
    #[serde(rename = "EC2InstanceId")]
    instance_id: String,

    #[serde(rename = "LifecycleHookName")]
    hook_name: String,

    #[serde(rename = "AutoScalingGroupName")]
    group_name: String,

    #[serde(rename = "LifecycleActionToken")]
    action_token: Option<String>,
}

pub fn parse_event(raw: &str) -> Result<LifecycleEvent> {
    let envelope: Envelope =
        serde_json::from_str(raw).context("malformed lifecycle event envelope")?;
    Ok(LifecycleEvent {
        instance_id: envelope.detail.instance_id,
        hook_name: envelope.detail.hook_name,
        group_name: envelope.detail.group_name,
        action_token: envelope.detail.action_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_envelope() {
        let raw = r#"{
            "detail": {
                "EC2InstanceId": "i-0abc",
                "LifecycleHookName": "control-plane-terminating",
                "AutoScalingGroupName": "prod-control-plane",
                "LifecycleActionToken": "token-123"
            }
        }"#;
        let event = parse_event(raw).unwrap();
        assert_eq!(event.instance_id, "i-0abc");
        assert_eq!(event.hook_name, "control-plane-terminating");
        assert_eq!(event.group_name, "prod-control-plane");
        assert_eq!(event.action_token.as_deref(), Some("token-123"));
    }

    #[test]
    fn action_token_is_optional() {
        let raw = r#"{
            "detail": {
                "EC2InstanceId": "i-0abc",
                "LifecycleHookName": "hook",
                "AutoScalingGroupName": "group"
            }
        }"#;
        let event = parse_event(raw).unwrap();
        assert!(event.action_token.is_none());
    }

    #[test]
    fn rejects_envelopes_without_detail() {
        assert!(parse_event(r#"{"source": "aws.autoscaling"}"#).is_err());
        assert!(parse_event("not json").is_err());
    }
}
