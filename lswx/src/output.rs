//! Output formatting for list mode.

use anyhow::{Result, bail};
use toplevelev::{Capabilities, StateFlags, ToplevelRecord};

/// Longest app-id column we are willing to pad to.
const MAX_PAD: usize = 40;

const APP_ID_HEADER: &str = "app-id:";
const TITLE_HEADER: &str = "title:";

/// Column-aligned human output with a header line.
pub fn normal(records: &[ToplevelRecord]) -> String {
    let quoted: Vec<(String, String)> = records
        .iter()
        .map(|r| (quote_field(&r.app_id), quote_field(&r.title)))
        .collect();

    let width = quoted
        .iter()
        .map(|(app_id, _)| app_id.chars().count())
        .chain(std::iter::once(APP_ID_HEADER.len()))
        .max()
        .unwrap_or(0)
        .min(MAX_PAD);

    let mut out = String::new();
    out.push_str(&format!("{APP_ID_HEADER:width$}  {TITLE_HEADER}\n"));
    for (app_id, title) in &quoted {
        out.push_str(&format!("{app_id:width$}  {title}\n"));
    }
    out
}

/// Quote a field when anything in it could break column parsing: empty
/// strings, whitespace, quotes, control or non-ASCII characters.
fn quote_field(value: &str) -> String {
    let plain =
        !value.is_empty() && value.chars().all(|c| c.is_ascii_graphic() && c != '"');
    if plain {
        return value.to_owned();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

/// Pretty-printed JSON array; properties the protocol cannot report are
/// null.
pub fn json(records: &[ToplevelRecord]) -> String {
    let array: Vec<serde_json::Value> = records
        .iter()
        .map(|r| {
            let states = r.states;
            serde_json::json!({
                "title": r.title,
                "app-id": r.app_id,
                "identifier": r.identifier,
                "fullscreen": states.map(|s| s.contains(StateFlags::FULLSCREEN)),
                "activated": states.map(|s| s.contains(StateFlags::ACTIVATED)),
                "maximized": states.map(|s| s.contains(StateFlags::MAXIMIZED)),
                "minimized": states.map(|s| s.contains(StateFlags::MINIMIZED)),
            })
        })
        .collect();
    let mut out = serde_json::to_string_pretty(&array).unwrap_or_else(|_| "[]".to_owned());
    out.push('\n');
    out
}

/// A comma-separated custom format, parsed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    AppId,
    Identifier,
    Fullscreen,
    Activated,
    Maximized,
    Minimized,
}

impl Field {
    fn parse(name: &str) -> Result<Field> {
        Ok(match name {
            "title" => Field::Title,
            "app-id" => Field::AppId,
            "identifier" => Field::Identifier,
            "fullscreen" => Field::Fullscreen,
            "activated" => Field::Activated,
            "maximized" => Field::Maximized,
            "minimized" => Field::Minimized,
            other => bail!("unknown field in custom format: '{other}'"),
        })
    }
}

#[derive(Debug)]
pub struct CustomFormat {
    fields: Vec<Field>,
}

impl CustomFormat {
    pub fn parse(spec: &str) -> Result<CustomFormat> {
        if spec.is_empty() {
            bail!("custom format must name at least one field");
        }
        let fields = spec
            .split(',')
            .map(|name| Field::parse(name.trim()))
            .collect::<Result<Vec<Field>>>()?;
        Ok(CustomFormat { fields })
    }

    /// One line per toplevel, fields joined by commas, literal commas in
    /// values escaped as `\,`.
    pub fn render(&self, records: &[ToplevelRecord], capabilities: Capabilities) -> String {
        let mut out = String::new();
        for record in records {
            let values: Vec<String> = self
                .fields
                .iter()
                .map(|&field| field_value(field, record, capabilities))
                .collect();
            out.push_str(&values.join(","));
            out.push('\n');
        }
        out
    }
}

fn field_value(field: Field, record: &ToplevelRecord, capabilities: Capabilities) -> String {
    match field {
        Field::Title => escape_commas(&record.title),
        Field::AppId => escape_commas(&record.app_id),
        Field::Identifier => match &record.identifier {
            Some(identifier) => escape_commas(identifier),
            None => "unsupported".to_owned(),
        },
        Field::Fullscreen => state_value(record, capabilities, StateFlags::FULLSCREEN),
        Field::Activated => state_value(record, capabilities, StateFlags::ACTIVATED),
        Field::Maximized => state_value(record, capabilities, StateFlags::MAXIMIZED),
        Field::Minimized => state_value(record, capabilities, StateFlags::MINIMIZED),
    }
}

fn state_value(record: &ToplevelRecord, capabilities: Capabilities, flag: StateFlags) -> String {
    if !capabilities.supports_state() {
        return "unsupported".to_owned();
    }
    match record.states {
        Some(states) => states.contains(flag).to_string(),
        None => "unsupported".to_owned(),
    }
}

fn escape_commas(value: &str) -> String {
    value.replace(',', "\\,")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(app_id: &str, title: &str) -> ToplevelRecord {
        ToplevelRecord {
            id: 0,
            title: title.to_owned(),
            app_id: app_id.to_owned(),
            identifier: None,
            states: None,
        }
    }

    #[test]
    fn normal_output_aligns_titles_after_the_longest_app_id() {
        let records = [record("firefox", "Browsing"), record("kitty", "~")];
        let out = normal(&records);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "app-id:  title:");
        assert_eq!(lines[1], "firefox  Browsing");
        assert_eq!(lines[2], "kitty    ~");
    }

    #[test]
    fn fields_with_whitespace_or_quotes_are_quoted_and_escaped() {
        assert_eq!(quote_field("plain"), "plain");
        assert_eq!(quote_field(""), "\"\"");
        assert_eq!(quote_field("two words"), "\"two words\"");
        assert_eq!(quote_field("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_field("a\nb"), "\"a\\nb\"");
        assert_eq!(quote_field("naïve"), "\"naïve\"");
    }

    #[test]
    fn pathological_app_ids_do_not_blow_up_the_padding() {
        let long = "x".repeat(200);
        let records = [record(&long, "t"), record("short", "u")];
        let out = normal(&records);
        let second = out.lines().nth(2).unwrap();
        assert!(second.starts_with("short"));
        assert_eq!(second.find("u").unwrap(), MAX_PAD + 2);
    }

    #[test]
    fn json_reports_unsupported_properties_as_null() {
        let records = [record("firefox", "Browsing")];
        let out = json(&records);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["app-id"], "firefox");
        assert!(parsed[0]["identifier"].is_null());
        assert!(parsed[0]["activated"].is_null());
    }

    #[test]
    fn json_reports_states_when_present() {
        let mut r = record("kitty", "~");
        r.states = Some(StateFlags::ACTIVATED);
        let out = json(&[r]);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["activated"], true);
        assert_eq!(parsed[0]["fullscreen"], false);
    }

    #[test]
    fn custom_format_rejects_unknown_fields() {
        assert!(CustomFormat::parse("title,bogus").is_err());
        assert!(CustomFormat::parse("").is_err());
        assert!(CustomFormat::parse("title, app-id").is_ok());
    }

    #[test]
    fn custom_format_escapes_commas_and_marks_unsupported() {
        let format = CustomFormat::parse("app-id,title,identifier,activated").unwrap();
        let mut r = record("org.gnome.Nautilus", "Files, mostly");
        r.states = Some(StateFlags::ACTIVATED);
        let out = format.render(&[r], Capabilities::empty());
        assert_eq!(
            out,
            "org.gnome.Nautilus,Files\\, mostly,unsupported,unsupported\n"
        );
    }

    #[test]
    fn every_state_field_renders_without_state_support() {
        let format = CustomFormat::parse("fullscreen,activated,maximized,minimized").unwrap();
        let r = record("kitty", "~");
        assert_eq!(
            format.render(&[r], Capabilities::empty()),
            "unsupported,unsupported,unsupported,unsupported\n"
        );
    }

    #[test]
    fn custom_format_renders_states_when_supported() {
        let format = CustomFormat::parse("activated,minimized").unwrap();
        let mut r = record("kitty", "~");
        r.states = Some(StateFlags::ACTIVATED);
        let caps = Capabilities::FULLSCREEN
            | Capabilities::ACTIVATED
            | Capabilities::MAXIMIZED
            | Capabilities::MINIMIZED;
        assert_eq!(format.render(&[r], caps), "true,false\n");
    }
}
