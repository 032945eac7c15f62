//! Line grammar for HL/Source-style server logs.
//!
//! Every line starts with `L MM/DD/YYYY - HH:MM:SS: `. The body is tried
//! against an ordered list of matchers and the first one that both matches
//! and accepts its captures decides the event kind. Lines nothing accepts are
//! kept as [`EventKind::Unrecognized`] so the tracker can count them.
//!
//! Player references look like `"Name<uid><steamid><team>"`. Names may
//! contain `<` and `"`, so a reference is only recognised by its trailing
//! `<uid><steamid><team>">` run.

use chrono::{NaiveDate, NaiveDateTime};
use regex::{Captures, Regex};
use shared::{Event, EventKind, PlayerRef, ServerId};

type Build = fn(&Captures<'_>) -> Option<EventKind>;

struct Matcher {
    name: &'static str,
    pattern: Regex,
    build: Build,
}

/// Stateless line-to-event mapper. Cheap to share behind an `Arc`.
pub struct EventParser {
    prefix: Regex,
    matchers: Vec<Matcher>,
}

const PREFIX: &str =
    r"^L (\d{2})/(\d{2})/(\d{4}) - (\d{2}):(\d{2}):(\d{2}): ?(.*)$";

/// Regex for one player reference whose groups are prefixed with `p`.
fn player_pattern(p: &str) -> String {
    format!(
        r#""(?P<{p}_name>.*?)<(?P<{p}_uid>-?\d+)><(?P<{p}_sid>[^<>]*)><(?P<{p}_team>[^<>]*)>"(?: \[[^\]]*\])?"#
    )
}

fn grammar() -> Vec<(&'static str, String, Build)> {
    let p = player_pattern("p");
    let a = player_pattern("a");
    let v = player_pattern("v");

    vec![
        (
            "connect",
            format!(r#"^{p} connected, address "(?P<address>[^"]*)""#),
            build_connect as Build,
        ),
        ("enter", format!(r"^{p} entered the game"), build_enter),
        (
            "disconnect",
            format!(r#"^{p} disconnected(?: \(reason "(?P<reason>.*)"\))?"#),
            build_disconnect,
        ),
        (
            "kill",
            format!(r#"^{a} killed {v} with "(?P<weapon>[^"]*)"(?P<props>.*)$"#),
            build_kill,
        ),
        (
            "damage",
            format!(r#"^{a} attacked {v} with "(?P<weapon>[^"]*)"(?P<props>.*)$"#),
            build_damage,
        ),
        (
            "suicide",
            format!(r#"^{p} committed suicide with "(?P<weapon>[^"]*)""#),
            build_suicide,
        ),
        (
            "chat",
            format!(r#"^{p} (?P<kind>say_team|say) "(?P<text>.*)""#),
            build_chat,
        ),
        (
            "join_team",
            format!(r#"^{p} joined team "(?P<team>[^"]*)""#),
            build_team,
        ),
        (
            "switch_team",
            r#"^"(?P<p_name>.*?)<(?P<p_uid>-?\d+)><(?P<p_sid>[^<>]*)>" switched from team <[^>]*> to <(?P<team>[^>]*)>"#
                .to_string(),
            build_team,
        ),
        (
            "name_change",
            format!(r#"^{p} changed name to "(?P<new_name>.*)""#),
            build_name_change,
        ),
        (
            "world_trigger",
            r#"^World triggered "(?P<trigger>[^"]*)""#.to_string(),
            build_world_trigger,
        ),
        (
            "team_trigger",
            r#"^Team "(?P<team>[^"]*)" triggered "(?P<trigger>[^"]*)""#.to_string(),
            build_team_trigger,
        ),
        (
            "map_change",
            r#"^(?:Loading|Started) map "(?P<map>[^"]*)""#.to_string(),
            build_map_change,
        ),
        ("game_over", r"^Game Over:".to_string(), build_game_over),
    ]
}

impl EventParser {
    pub fn new() -> Result<Self, regex::Error> {
        let mut matchers = Vec::new();
        for (name, pattern, build) in grammar() {
            matchers.push(Matcher {
                name,
                pattern: Regex::new(&pattern)?,
                build,
            });
        }

        Ok(Self {
            prefix: Regex::new(PREFIX)?,
            matchers,
        })
    }

    /// Maps one raw line to an event.
    pub fn parse(&self, server: &ServerId, line: &str) -> Event {
        let Some(caps) = self.prefix.captures(line) else {
            return Event::new(
                server.clone(),
                None,
                EventKind::Unrecognized {
                    text: line.to_string(),
                },
            );
        };

        let Some(timestamp) = parse_timestamp(&caps) else {
            return Event::new(
                server.clone(),
                None,
                EventKind::Unrecognized {
                    text: line.to_string(),
                },
            );
        };

        let body = caps.get(7).map_or("", |m| m.as_str());
        Event::new(server.clone(), Some(timestamp), self.parse_body(body))
    }

    /// Maps a line body (prefix already removed) to an event kind.
    pub fn parse_body(&self, body: &str) -> EventKind {
        self.matchers
            .iter()
            .find_map(|m| m.pattern.captures(body).and_then(|caps| (m.build)(&caps)))
            .unwrap_or_else(|| EventKind::Unrecognized {
                text: body.to_string(),
            })
    }

    /// Name of the matcher that accepts `body`, if any.
    pub fn matcher_for(&self, body: &str) -> Option<&'static str> {
        self.matchers.iter().find_map(|m| {
            m.pattern
                .captures(body)
                .and_then(|caps| (m.build)(&caps))
                .map(|_| m.name)
        })
    }

    pub fn matcher_names(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.name).collect()
    }
}

fn parse_timestamp(caps: &Captures<'_>) -> Option<NaiveDateTime> {
    let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let date = NaiveDate::from_ymd_opt(field(3)? as i32, field(1)?, field(2)?)?;
    date.and_hms_opt(field(4)?, field(5)?, field(6)?)
}

fn group<'a>(caps: &'a Captures<'_>, name: &str) -> Option<&'a str> {
    caps.name(name).map(|m| m.as_str())
}

fn player(caps: &Captures<'_>, p: &str) -> Option<PlayerRef> {
    let name = group(caps, &format!("{p}_name"))?;
    let uid = group(caps, &format!("{p}_uid")).and_then(|u| u.parse::<u32>().ok());
    let sid = group(caps, &format!("{p}_sid")).unwrap_or("");
    let team = group(caps, &format!("{p}_team")).unwrap_or("");

    let (steam_id, is_bot) = match sid {
        "BOT" => (None, true),
        "" | "Console" | "STEAM_ID_PENDING" | "STEAM_ID_LAN" | "UNKNOWN" => (None, false),
        other => (Some(other.to_string()), false),
    };

    let team = match team {
        "" | "Unassigned" | "Console" => None,
        other => Some(other.to_string()),
    };

    Some(PlayerRef {
        name: name.to_string(),
        uid,
        steam_id,
        team,
        is_bot,
    })
}

/// Value of a trailing `(key "value")` property.
fn property<'a>(props: &'a str, key: &str) -> Option<&'a str> {
    let open = format!("({key} \"");
    let start = props.find(&open)? + open.len();
    let len = props[start..].find("\")")?;
    Some(&props[start..start + len])
}

fn build_connect(caps: &Captures<'_>) -> Option<EventKind> {
    Some(EventKind::PlayerConnect {
        player: player(caps, "p")?,
        address: group(caps, "address").map(str::to_string),
    })
}

fn build_enter(caps: &Captures<'_>) -> Option<EventKind> {
    Some(EventKind::PlayerConnect {
        player: player(caps, "p")?,
        address: None,
    })
}

fn build_disconnect(caps: &Captures<'_>) -> Option<EventKind> {
    Some(EventKind::PlayerDisconnect {
        player: player(caps, "p")?,
        reason: group(caps, "reason").map(str::to_string),
    })
}

fn build_kill(caps: &Captures<'_>) -> Option<EventKind> {
    let props = group(caps, "props").unwrap_or("");
    let headshot = props.contains("(headshot)") || property(props, "customkill") == Some("headshot");
    Some(EventKind::Kill {
        attacker: player(caps, "a")?,
        victim: player(caps, "v")?,
        weapon: group(caps, "weapon")?.to_string(),
        headshot,
    })
}

fn build_damage(caps: &Captures<'_>) -> Option<EventKind> {
    let props = group(caps, "props").unwrap_or("");
    let amount = property(props, "damage")?.parse().ok()?;
    Some(EventKind::Damage {
        attacker: player(caps, "a")?,
        victim: player(caps, "v")?,
        weapon: group(caps, "weapon")?.to_string(),
        amount,
        hitgroup: property(props, "hitgroup").map(str::to_string),
    })
}

fn build_suicide(caps: &Captures<'_>) -> Option<EventKind> {
    Some(EventKind::Suicide {
        player: player(caps, "p")?,
        weapon: group(caps, "weapon")?.to_string(),
    })
}

fn build_chat(caps: &Captures<'_>) -> Option<EventKind> {
    Some(EventKind::ChatMessage {
        player: player(caps, "p")?,
        text: group(caps, "text")?.to_string(),
        team_only: group(caps, "kind") == Some("say_team"),
    })
}

fn build_team(caps: &Captures<'_>) -> Option<EventKind> {
    Some(EventKind::TeamChange {
        player: player(caps, "p")?,
        team: group(caps, "team")?.to_string(),
    })
}

fn build_name_change(caps: &Captures<'_>) -> Option<EventKind> {
    Some(EventKind::NameChange {
        player: player(caps, "p")?,
        new_name: group(caps, "new_name")?.to_string(),
    })
}

fn build_world_trigger(caps: &Captures<'_>) -> Option<EventKind> {
    match group(caps, "trigger")? {
        "Round_Start" => Some(EventKind::RoundStart),
        "Round_End" => Some(EventKind::RoundEnd { winner: None }),
        _ => None,
    }
}

fn build_team_trigger(caps: &Captures<'_>) -> Option<EventKind> {
    let trigger = group(caps, "trigger")?;
    if !trigger.to_ascii_lowercase().contains("win") {
        return None;
    }
    Some(EventKind::RoundEnd {
        winner: Some(group(caps, "team")?.to_string()),
    })
}

fn build_map_change(caps: &Captures<'_>) -> Option<EventKind> {
    Some(EventKind::MapChange {
        map: group(caps, "map")?.to_string(),
    })
}

fn build_game_over(_caps: &Captures<'_>) -> Option<EventKind> {
    Some(EventKind::GameOver)
}
