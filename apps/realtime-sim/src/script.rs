use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use realtime_hub::{parse_kinds, ChangeKind, ChannelStatus, HostEvent};
use serde_json::Value;

/// One line of a simulator script.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Subscribe {
        name: String,
        group: String,
        resource: String,
        kinds: BTreeSet<ChangeKind>,
        filter: Option<String>,
    },
    Unsubscribe(String),
    Emit {
        group: String,
        kind: ChangeKind,
        resource: String,
        record: Value,
    },
    Status {
        group: String,
        status: ChannelStatus,
    },
    WriteBegin(String),
    WriteEnd(String),
    Host(HostEvent),
    Focus(bool),
    Disable(Duration),
    Cleanup,
    Sleep(Duration),
    Health,
    Metrics,
    Subscriptions,
    Quit,
}

/// Parse one script line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut rest = line;
    let verb = required(&mut rest, "command")?;
    let command = match verb {
        "sub" => Command::Subscribe {
            name: required(&mut rest, "subscription name")?.to_string(),
            group: required(&mut rest, "group")?.to_string(),
            resource: required(&mut rest, "resource")?.to_string(),
            kinds: parse_kinds(required(&mut rest, "kinds")?)?,
            filter: take_word(&mut rest).map(str::to_string),
        },
        "unsub" => Command::Unsubscribe(required(&mut rest, "subscription name")?.to_string()),
        "emit" => {
            let group = required(&mut rest, "group")?.to_string();
            let kind = required(&mut rest, "kind")?.parse::<ChangeKind>()?;
            let resource = required(&mut rest, "resource")?.to_string();
            let record = match rest.trim() {
                "" => Value::Object(Default::default()),
                raw => serde_json::from_str(raw).context("record must be JSON")?,
            };
            Command::Emit {
                group,
                kind,
                resource,
                record,
            }
        }
        "status" => {
            let group = required(&mut rest, "group")?.to_string();
            let status = match required(&mut rest, "status")? {
                "established" => ChannelStatus::Established,
                "timeout" => ChannelStatus::Timeout,
                "closed" => ChannelStatus::Closed,
                "error" => ChannelStatus::Error(match rest.trim() {
                    "" => "simulated error".to_string(),
                    message => message.to_string(),
                }),
                other => bail!("unknown channel status {other:?}"),
            };
            Command::Status { group, status }
        }
        "write-begin" => Command::WriteBegin(required(&mut rest, "operation id")?.to_string()),
        "write-end" => Command::WriteEnd(required(&mut rest, "operation id")?.to_string()),
        "hide" => Command::Host(HostEvent::Hidden),
        "show" => Command::Host(HostEvent::Visible),
        "unload" => Command::Host(HostEvent::Unload),
        "focus" => match required(&mut rest, "on|off")? {
            "on" => Command::Focus(true),
            "off" => Command::Focus(false),
            other => bail!("focus expects on or off, got {other:?}"),
        },
        "disable" => Command::Disable(millis(&mut rest)?),
        "cleanup" => Command::Cleanup,
        "sleep" => Command::Sleep(millis(&mut rest)?),
        "health" => Command::Health,
        "metrics" => Command::Metrics,
        "subs" => Command::Subscriptions,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command {other:?}"),
    };
    Ok(Some(command))
}

fn take_word<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (word, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(word)
}

fn required<'a>(rest: &mut &'a str, what: &str) -> Result<&'a str> {
    take_word(rest).ok_or_else(|| anyhow!("missing {what}"))
}

fn millis(rest: &mut &str) -> Result<Duration> {
    let raw = required(rest, "milliseconds")?;
    let ms: u64 = raw
        .parse()
        .with_context(|| format!("invalid milliseconds {raw:?}"))?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn skips_blank_lines_and_comments() {
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("# warm up").unwrap(), None);
    }

    #[test]
    fn parses_subscriptions_with_and_without_filters() {
        let plain = parse_line("sub feed g workouts update,insert").unwrap().unwrap();
        match plain {
            Command::Subscribe { name, kinds, filter, .. } => {
                assert_eq!(name, "feed");
                assert_eq!(kinds.len(), 2);
                assert_eq!(filter, None);
            }
            other => panic!("unexpected {other:?}"),
        }

        let filtered = parse_line("sub mine g sets * user_id=eq.1").unwrap().unwrap();
        assert!(matches!(
            filtered,
            Command::Subscribe { ref filter, ref kinds, .. }
                if filter.as_deref() == Some("user_id=eq.1") && kinds.len() == 3
        ));
    }

    #[test]
    fn emit_keeps_json_with_spaces() {
        let command = parse_line(r#"emit g UPDATE workouts {"id": 1, "name": "leg day"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            command,
            Command::Emit {
                group: "g".into(),
                kind: ChangeKind::Update,
                resource: "workouts".into(),
                record: json!({"id": 1, "name": "leg day"}),
            }
        );
    }

    #[test]
    fn parses_status_and_host_commands() {
        assert_eq!(
            parse_line("status g error socket reset").unwrap(),
            Some(Command::Status {
                group: "g".into(),
                status: ChannelStatus::Error("socket reset".into()),
            })
        );
        assert_eq!(parse_line("hide").unwrap(), Some(Command::Host(HostEvent::Hidden)));
        assert_eq!(parse_line("focus on").unwrap(), Some(Command::Focus(true)));
        assert_eq!(
            parse_line("sleep 250").unwrap(),
            Some(Command::Sleep(Duration::from_millis(250)))
        );
    }

    #[test]
    fn reports_malformed_lines() {
        assert!(parse_line("sub feed g").is_err());
        assert!(parse_line("emit g TRUNCATE workouts").is_err());
        assert!(parse_line("emit g UPDATE workouts {not json").is_err());
        assert!(parse_line("status g flapping").is_err());
        assert!(parse_line("sleep soon").is_err());
        assert!(parse_line("dance").is_err());
    }
}
