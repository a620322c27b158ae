//! Rendering a [`CycleReport`] for delivery.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::types::{ContainerStatus, CycleReport};

const TITLE: &str = "Docker Image Watch";

/// Overall result of a cycle, as shown in headlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Headline {
    CompletedWithErrors,
    UpdatesApplied,
    NothingToDo,
}

impl Headline {
    pub fn of(report: &CycleReport) -> Self {
        if report.containers_failed > 0 {
            Headline::CompletedWithErrors
        } else if report.containers_updated > 0 {
            Headline::UpdatesApplied
        } else {
            Headline::NothingToDo
        }
    }

    fn emoji(self) -> &'static str {
        match self {
            Headline::CompletedWithErrors => "⚠️",
            Headline::UpdatesApplied => "✅",
            Headline::NothingToDo => "✓",
        }
    }

    fn text(self) -> &'static str {
        match self {
            Headline::CompletedWithErrors => "Completed with errors",
            Headline::UpdatesApplied => "Updates applied",
            Headline::NothingToDo => "No updates needed",
        }
    }

    fn slack_color(self) -> &'static str {
        match self {
            Headline::CompletedWithErrors => "warning",
            Headline::UpdatesApplied => "good",
            Headline::NothingToDo => "#36a64f",
        }
    }

    fn discord_color(self) -> u32 {
        match self {
            Headline::CompletedWithErrors => 0xFFA500,
            Headline::UpdatesApplied => 0x00FF00,
            Headline::NothingToDo => 0x36A64F,
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

impl CycleReport {
    pub fn to_markdown(&self) -> String {
        let headline = Headline::of(self);
        let mut lines = vec![
            format!("## {} {} Report", headline.emoji(), TITLE),
            String::new(),
            format!("**Host:** `{}`", self.hostname),
            format!("**Time:** {}", self.timestamp),
            format!("**Duration:** {:.1}s", self.duration_seconds),
            String::new(),
            "### Summary".to_string(),
            "| Metric | Value |".to_string(),
            "|--------|-------|".to_string(),
            format!("| Status | {} |", headline.text()),
            format!("| Containers checked | {} |", self.containers_checked),
            format!("| Updated | {} |", self.containers_updated),
            format!("| Skipped | {} |", self.containers_skipped),
            format!("| Failed | {} |", self.containers_failed),
            format!("| Images cleaned | {} |", self.images_cleaned),
            format!("| Space reclaimed | {:.2} MB |", self.space_reclaimed_mb),
        ];

        if !self.container_reports.is_empty() {
            lines.extend(["".to_string(), "### Container Details".to_string(), "".to_string()]);

            let sections = [
                (ContainerStatus::Updated, "**🔄 Updated:**"),
                (ContainerStatus::PendingRestart, "**🔄 Self-Update (restarting):**"),
                (ContainerStatus::Error, "**❌ Errors:**"),
                (ContainerStatus::Skipped, "**⏭️ Skipped:**"),
                (ContainerStatus::UpToDate, "**✓ Up to date:**"),
            ];
            for (status, heading) in sections {
                let entries: Vec<_> = self.with_status(status).collect();
                if entries.is_empty() {
                    continue;
                }
                lines.push(heading.to_string());
                for c in entries {
                    let line = match status {
                        ContainerStatus::Error => format!("- `{}`: {}", c.name, c.message),
                        ContainerStatus::Skipped if c.message.is_empty() => format!("- `{}`", c.name),
                        ContainerStatus::Skipped => format!("- `{}` - {}", c.name, c.message),
                        ContainerStatus::Updated
                        | ContainerStatus::PendingRestart
                        | ContainerStatus::UpToDate => format!("- `{}` ({})", c.name, c.image),
                    };
                    lines.push(line);
                }
                lines.push(String::new());
            }
        }

        if !self.errors.is_empty() {
            lines.extend(["".to_string(), "### Errors".to_string(), "".to_string()]);
            lines.extend(self.errors.iter().map(|e| format!("- {}", e)));
        }

        lines.join("\n")
    }

    pub fn to_slack(&self, now: DateTime<Utc>) -> Value {
        let headline = Headline::of(self);

        let mut summary = Vec::new();
        if self.containers_updated > 0 {
            summary.push(format!("{} updated", self.containers_updated));
        }
        if self.containers_skipped > 0 {
            summary.push(format!("{} skipped", self.containers_skipped));
        }
        if self.containers_failed > 0 {
            summary.push(format!("{} failed", self.containers_failed));
        }
        let summary = if summary.is_empty() {
            "All containers checked".to_string()
        } else {
            summary.join(", ")
        };

        let mut fields = vec![
            json!({"title": "Host", "value": self.hostname, "short": true}),
            json!({"title": "Duration", "value": format!("{:.1}s", self.duration_seconds), "short": true}),
            json!({"title": "Containers", "value": format!("{} checked", self.containers_checked), "short": true}),
            json!({"title": "Cleanup", "value": format!("{:.2} MB freed", self.space_reclaimed_mb), "short": true}),
        ];

        let updated: Vec<String> = self
            .with_status(ContainerStatus::Updated)
            .map(|c| format!("`{}`", c.name))
            .collect();
        if !updated.is_empty() {
            fields.push(json!({"title": "🔄 Updated", "value": updated.join("\n"), "short": false}));
        }

        let errors: Vec<String> = self
            .with_status(ContainerStatus::Error)
            .map(|c| format!("`{}`: {}", c.name, c.message))
            .collect();
        if !errors.is_empty() {
            fields.push(json!({"title": "❌ Errors", "value": errors.join("\n"), "short": false}));
        }

        json!({
            "attachments": [{
                "color": headline.slack_color(),
                "title": format!("{} {} - {}", headline.emoji(), TITLE, headline.text()),
                "text": summary,
                "fields": fields,
                "footer": TITLE,
                "ts": now.timestamp(),
            }]
        })
    }

    pub fn to_discord(&self, now: DateTime<Utc>) -> Value {
        let headline = Headline::of(self);

        let mut fields = vec![
            json!({"name": "Host", "value": format!("`{}`", self.hostname), "inline": true}),
            json!({"name": "Duration", "value": format!("{:.1}s", self.duration_seconds), "inline": true}),
            json!({"name": "Containers", "value": self.containers_checked.to_string(), "inline": true}),
        ];

        let updated: Vec<String> = self
            .with_status(ContainerStatus::Updated)
            .take(10)
            .map(|c| format!("`{}`", c.name))
            .collect();
        if !updated.is_empty() {
            fields.push(json!({"name": "🔄 Updated", "value": updated.join("\n"), "inline": false}));
        }

        let errors: Vec<String> = self
            .with_status(ContainerStatus::Error)
            .take(5)
            .map(|c| format!("`{}`: {}", c.name, truncate(&c.message, 50)))
            .collect();
        if !errors.is_empty() {
            fields.push(json!({"name": "❌ Errors", "value": errors.join("\n"), "inline": false}));
        }

        if self.images_cleaned > 0 || self.space_reclaimed_mb > 0.0 {
            fields.push(json!({
                "name": "🧹 Cleanup",
                "value": format!("{} images, {:.2} MB freed", self.images_cleaned, self.space_reclaimed_mb),
                "inline": false,
            }));
        }

        json!({
            "embeds": [{
                "title": format!("{} - {} {}", TITLE, headline.emoji(), headline.text()),
                "color": headline.discord_color(),
                "fields": fields,
                "timestamp": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                "footer": {"text": TITLE},
            }]
        })
    }

    pub fn to_telegram(&self) -> Value {
        json!({"text": self.to_markdown(), "parse_mode": "Markdown"})
    }

    /// Markdown under the field names common chat webhooks look for.
    pub fn to_markdown_payload(&self) -> Value {
        let text = self.to_markdown();
        json!({"text": text, "content": text, "message": text})
    }

    pub fn to_generic(&self) -> Value {
        let text = self.to_markdown();
        json!({"text": text, "content": text, "message": text, "body": text})
    }
}
