use chrono::Utc;
use serde::Serialize;
use tera::{Context, Tera};

/// Shared rendering context for one instance's notification.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    pub account_name: String,
    pub region: String,
    pub instance_name: String,
    pub instance_id: String,
    pub public_ip: Option<String>,
    pub remaining_gb: f64,
    pub threshold_gb: f64,
}

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    TrafficWarning {
        ctx: InstanceContext,
        usage_percentage: f64,
    },
    ShutdownSubmitted {
        ctx: InstanceContext,
        reason: String,
        provider_job_id: String,
    },
    ShutdownSucceeded {
        ctx: InstanceContext,
        provider_job_id: String,
    },
    ShutdownFailed {
        ctx: InstanceContext,
        provider_job_id: Option<String>,
        error: String,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::TrafficWarning { .. } => "traffic_warning",
            NotificationEvent::ShutdownSubmitted { .. } => "shutdown_submitted",
            NotificationEvent::ShutdownSucceeded { .. } => "shutdown_succeeded",
            NotificationEvent::ShutdownFailed { .. } => "shutdown_failed",
        }
    }

    fn ctx(&self) -> &InstanceContext {
        match self {
            NotificationEvent::TrafficWarning { ctx, .. }
            | NotificationEvent::ShutdownSubmitted { ctx, .. }
            | NotificationEvent::ShutdownSucceeded { ctx, .. }
            | NotificationEvent::ShutdownFailed { ctx, .. } => ctx,
        }
    }
}

/// Interactive-card webhook payload.
#[derive(Debug, Clone, Serialize)]
pub struct CardMessage {
    pub msg_type: &'static str,
    pub card: Card,
}

#[derive(Debug, Clone, Serialize)]
pub struct Card {
    pub config: CardConfig,
    pub header: CardHeader,
    pub elements: Vec<CardElement>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardConfig {
    pub wide_screen_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardHeader {
    pub title: CardText,
    pub template: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardText {
    pub tag: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardElement {
    pub tag: &'static str,
    pub text: CardText,
}

const WARNING_BODY: &str = "\
**Severity**: {{ severity }}
**Account**: {{ account_name }}
**Region**: {{ region }}
**Instance**: {{ instance_name }}{% if public_ip %} ({{ public_ip }}){% endif %}

---

**Remaining traffic**: {{ remaining_gb }} GB
**Threshold**: {{ threshold_gb }} GB
**Usage**: {{ usage_percentage }}%

---

**Time**: {{ now }}";

const SUBMITTED_BODY: &str = "\
**Account**: {{ account_name }}
**Region**: {{ region }}
**Instance**: {{ instance_name }}{% if public_ip %} ({{ public_ip }}){% endif %}
**Reason**: {{ reason }}

---

**Remaining traffic**: {{ remaining_gb }} GB
**Threshold**: {{ threshold_gb }} GB
**Provider job**: {{ provider_job_id }}

---

**Time**: {{ now }}";

const SUCCEEDED_BODY: &str = "\
**Account**: {{ account_name }}
**Region**: {{ region }}
**Instance**: {{ instance_name }}{% if public_ip %} ({{ public_ip }}){% endif %}

---

**Remaining traffic**: {{ remaining_gb }} GB
**Threshold**: {{ threshold_gb }} GB
**Provider job**: {{ provider_job_id }}

---

**Time**: {{ now }}";

const FAILED_BODY: &str = "\
**Account**: {{ account_name }}
**Region**: {{ region }}
**Instance**: {{ instance_name }}{% if public_ip %} ({{ public_ip }}){% endif %}

---

**Remaining traffic**: {{ remaining_gb }} GB
**Threshold**: {{ threshold_gb }} GB
{% if provider_job_id %}**Provider job**: {{ provider_job_id }}
{% endif %}**Error**: {{ error }}

---

**Time**: {{ now }}";

fn warning_severity(usage_percentage: f64) -> (&'static str, &'static str) {
    if usage_percentage >= 90.0 {
        ("red", "critical")
    } else if usage_percentage >= 80.0 {
        ("orange", "high")
    } else {
        ("yellow", "elevated")
    }
}

/// Renders an event into a card payload. The body is a tera one-off over a
/// fixed markdown template.
pub fn render(event: &NotificationEvent) -> Result<CardMessage, tera::Error> {
    let ctx = event.ctx();
    let mut context = Context::new();
    context.insert("account_name", &ctx.account_name);
    context.insert("region", &ctx.region);
    context.insert("instance_name", &ctx.instance_name);
    context.insert("public_ip", &ctx.public_ip);
    context.insert("remaining_gb", &format!("{:.2}", ctx.remaining_gb));
    context.insert("threshold_gb", &format!("{:.2}", ctx.threshold_gb));
    context.insert("now", &Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string());

    let (title, color, template) = match event {
        NotificationEvent::TrafficWarning {
            usage_percentage, ..
        } => {
            let (color, severity) = warning_severity(*usage_percentage);
            context.insert("severity", severity);
            context.insert("usage_percentage", &format!("{usage_percentage:.1}"));
            ("Traffic usage warning", color, WARNING_BODY)
        }
        NotificationEvent::ShutdownSubmitted {
            reason,
            provider_job_id,
            ..
        } => {
            context.insert("reason", reason);
            context.insert("provider_job_id", provider_job_id);
            ("Automatic shutdown submitted", "orange", SUBMITTED_BODY)
        }
        NotificationEvent::ShutdownSucceeded {
            provider_job_id, ..
        } => {
            context.insert("provider_job_id", provider_job_id);
            ("Automatic shutdown completed", "green", SUCCEEDED_BODY)
        }
        NotificationEvent::ShutdownFailed {
            provider_job_id,
            error,
            ..
        } => {
            context.insert("provider_job_id", provider_job_id);
            context.insert("error", error);
            ("Automatic shutdown failed", "red", FAILED_BODY)
        }
    };

    let content = Tera::one_off(template, &context, false)?;
    Ok(CardMessage {
        msg_type: "interactive",
        card: Card {
            config: CardConfig {
                wide_screen_mode: true,
            },
            header: CardHeader {
                title: CardText {
                    tag: "plain_text",
                    content: title.to_string(),
                },
                template: color,
            },
            elements: vec![CardElement {
                tag: "div",
                text: CardText {
                    tag: "lark_md",
                    content,
                },
            }],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InstanceContext {
        InstanceContext {
            account_name: "prod".to_string(),
            region: "eu-west-0".to_string(),
            instance_name: "web-1".to_string(),
            instance_id: "srv-1".to_string(),
            public_ip: Some("203.0.113.9".to_string()),
            remaining_gb: 8.0,
            threshold_gb: 10.0,
        }
    }

    #[test]
    fn warning_card_escalates_color_with_usage() {
        for (usage, color) in [(72.0, "yellow"), (85.0, "orange"), (95.0, "red")] {
            let card = render(&NotificationEvent::TrafficWarning {
                ctx: ctx(),
                usage_percentage: usage,
            })
            .unwrap();
            assert_eq!(card.card.header.template, color);
        }
    }

    #[test]
    fn failed_card_carries_error_and_instance_details() {
        let card = render(&NotificationEvent::ShutdownFailed {
            ctx: ctx(),
            provider_job_id: Some("job-9".to_string()),
            error: "timeout".to_string(),
        })
        .unwrap();
        assert_eq!(card.msg_type, "interactive");
        let body = &card.card.elements[0].text.content;
        assert!(body.contains("web-1"));
        assert!(body.contains("203.0.113.9"));
        assert!(body.contains("8.00 GB"));
        assert!(body.contains("job-9"));
        assert!(body.contains("timeout"));
    }

    #[test]
    fn body_omits_public_ip_when_absent() {
        let mut context = ctx();
        context.public_ip = None;
        let card = render(&NotificationEvent::ShutdownSucceeded {
            ctx: context,
            provider_job_id: "job-2".to_string(),
        })
        .unwrap();
        let body = &card.card.elements[0].text.content;
        assert!(body.contains("**Instance**: web-1\n"));
        assert!(!body.contains("("));
    }
}
