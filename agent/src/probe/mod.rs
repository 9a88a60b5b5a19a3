//! Probe configuration document
//!
//! A probe document is a TOML file with two arrays of tables:
//!
//! ```toml
//! [[probes]]          # base probes
//! name = "system_infos"
//! command = "/opt/gala-gopher/extend_probes/system_infos"
//! param = ""
//! switch = "on"
//!
//! [[extend_probes]]   # extended probes
//! name = "tcp"
//! command = ""
//! param = ""
//! start_check = "ss -tn | wc -l"
//! check_type = "count"
//! switch = "auto"
//! ```
//!
//! The parsed document is kept as written. Saving rewrites only the
//! `switch` value of probes whose mode was changed; comments, layout,
//! unknown keys and entries the agent cannot interpret stay as they were.

pub mod reconcile;
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use toml_edit::{value, ArrayOfTables, DocumentMut, Item, Table, TableLike};
use tracing::warn;

pub use reconcile::{ProbeReconciler, ReconcilePlan, ReconciliationReport, RejectReason, Rejection};
pub use store::ProbeConfigStore;

pub const BASE_SECTION: &str = "probes";
pub const EXTENDED_SECTION: &str = "extend_probes";

/// Collection mode of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchMode {
    On,
    Off,
    Auto,
}

impl SwitchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SwitchMode::On => "on",
            SwitchMode::Off => "off",
            SwitchMode::Auto => "auto",
        }
    }
}

impl fmt::Display for SwitchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwitchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(SwitchMode::On),
            "off" => Ok(SwitchMode::Off),
            "auto" => Ok(SwitchMode::Auto),
            other => Err(format!("unknown switch mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Base,
    Extended,
}

impl Section {
    fn key(self) -> &'static str {
        match self {
            Section::Base => BASE_SECTION,
            Section::Extended => EXTENDED_SECTION,
        }
    }
}

/// One named collection item
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub name: String,
    pub command: String,
    pub param: String,
    pub start_check: Option<String>,
    pub check_type: Option<String>,
    switch: SwitchMode,
    // Position of the entry in its section; `None` until placed in a document.
    slot: Option<(Section, usize)>,
    dirty: bool,
}

impl Probe {
    pub fn new(name: impl Into<String>, switch: SwitchMode) -> Self {
        Self {
            name: name.into(),
            command: String::new(),
            param: String::new(),
            start_check: None,
            check_type: None,
            switch,
            slot: None,
            dirty: false,
        }
    }

    /// Attach a startup check, which makes the probe eligible for `auto`.
    pub fn with_start_check(mut self, check: &str, check_type: &str) -> Self {
        self.start_check = Some(check.into());
        self.check_type = Some(check_type.into());
        self
    }

    /// Read one entry of a probe section.
    ///
    /// Returns `None` for entries without a string `name`; such entries stay
    /// in the document but are invisible to the agent.
    fn from_entry(entry: &dyn TableLike, section: Section, index: usize) -> Option<Self> {
        let name = entry.get("name")?.as_str()?.to_string();
        let text = |key: &str| entry.get(key).and_then(Item::as_str).unwrap_or_default().to_string();
        let switch = match entry.get("switch") {
            None => SwitchMode::Off,
            Some(item) => match item.as_str().map(str::parse::<SwitchMode>) {
                Some(Ok(mode)) => mode,
                Some(Err(e)) => {
                    warn!("Probe {name}: {e}, treating as off");
                    SwitchMode::Off
                }
                None => {
                    warn!("Probe {name}: switch is not a string, treating as off");
                    SwitchMode::Off
                }
            },
        };
        let start_check = entry.get("start_check").and_then(Item::as_value).map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string().trim().to_string(),
        });

        Some(Self {
            command: text("command"),
            param: text("param"),
            start_check,
            check_type: entry.get("check_type").and_then(Item::as_str).map(str::to_string),
            switch,
            slot: Some((section, index)),
            dirty: false,
            name,
        })
    }

    pub fn switch(&self) -> SwitchMode {
        self.switch
    }

    /// Change the mode. Only probes changed this way are written on save.
    pub fn set_switch(&mut self, mode: SwitchMode) {
        self.switch = mode;
        self.dirty = true;
    }

    pub fn is_modified(&self) -> bool {
        self.dirty
    }

    pub fn supports_auto(&self) -> bool {
        self.start_check.is_some()
    }

    fn to_entry(&self) -> Table {
        let mut table = Table::new();
        table.insert("name", value(self.name.as_str()));
        table.insert("command", value(self.command.as_str()));
        table.insert("param", value(self.param.as_str()));
        if let Some(check) = &self.start_check {
            table.insert("start_check", value(check.as_str()));
        }
        if let Some(check_type) = &self.check_type {
            table.insert("check_type", value(check_type.as_str()));
        }
        table.insert("switch", value(self.switch.as_str()));
        table
    }
}

/// Probes of one plugin, split into the base and extended groups, on top
/// of the document they were read from.
#[derive(Debug, Clone, Default)]
pub struct ProbeConfigDocument {
    doc: DocumentMut,
    base: Vec<Probe>,
    extended: Vec<Probe>,
}

impl ProbeConfigDocument {
    /// Build a fresh document holding `base` and `extended`.
    pub fn new(base: Vec<Probe>, extended: Vec<Probe>) -> Self {
        let mut doc = DocumentMut::new();
        let mut place = |section: Section, probes: Vec<Probe>| {
            let mut tables = ArrayOfTables::new();
            let probes: Vec<Probe> = probes
                .into_iter()
                .enumerate()
                .map(|(index, mut probe)| {
                    tables.push(probe.to_entry());
                    probe.slot = Some((section, index));
                    probe.dirty = false;
                    probe
                })
                .collect();
            if !tables.is_empty() {
                doc.insert(section.key(), Item::ArrayOfTables(tables));
            }
            probes
        };
        let base = place(Section::Base, base);
        let extended = place(Section::Extended, extended);
        Self { doc, base, extended }
    }

    pub fn parse(content: &str) -> Result<Self, toml_edit::TomlError> {
        Ok(Self::from_document(content.parse()?))
    }

    /// Interpret a parsed document. Without a `probes` section no probe is
    /// visible, whatever else the document holds.
    pub fn from_document(doc: DocumentMut) -> Self {
        if !doc.contains_key(BASE_SECTION) {
            warn!("Probe document has no `{BASE_SECTION}` section");
            return Self {
                doc,
                base: Vec::new(),
                extended: Vec::new(),
            };
        }
        let base = section(&doc, Section::Base);
        let extended = section(&doc, Section::Extended);
        Self { doc, base, extended }
    }

    /// Document text with the switches of modified probes written in place.
    pub fn render(&self) -> String {
        let mut doc = self.doc.clone();
        for probe in self.probes().filter(|p| p.dirty) {
            let entry = match probe.slot {
                Some((section, index)) => entry_mut(&mut doc, section, index),
                None => None,
            };
            match entry {
                Some(entry) => write_switch(entry, probe.switch),
                None => warn!("Probe {} has no entry to update", probe.name),
            }
        }
        doc.to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.extended.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        self.probes().any(Probe::is_modified)
    }

    pub fn base(&self) -> &[Probe] {
        &self.base
    }

    pub fn extended(&self) -> &[Probe] {
        &self.extended
    }

    /// All probes, base group first.
    pub fn probes(&self) -> impl Iterator<Item = &Probe> {
        self.base.iter().chain(self.extended.iter())
    }

    pub fn probes_mut(&mut self) -> impl Iterator<Item = &mut Probe> {
        self.base.iter_mut().chain(self.extended.iter_mut())
    }

    pub fn get(&self, name: &str) -> Option<&Probe> {
        self.probes().find(|p| p.name == name)
    }
}

fn section(doc: &DocumentMut, section: Section) -> Vec<Probe> {
    match doc.get(section.key()) {
        Some(Item::ArrayOfTables(tables)) => tables
            .iter()
            .enumerate()
            .filter_map(|(index, table)| Probe::from_entry(table, section, index))
            .collect(),
        Some(Item::Value(toml_edit::Value::Array(array))) => array
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                entry
                    .as_inline_table()
                    .and_then(|table| Probe::from_entry(table, section, index))
            })
            .collect(),
        Some(_) => {
            warn!("Probe section `{}` is not an array of tables", section.key());
            Vec::new()
        }
        None => Vec::new(),
    }
}

fn entry_mut(doc: &mut DocumentMut, section: Section, index: usize) -> Option<&mut dyn TableLike> {
    match doc.get_mut(section.key())? {
        Item::ArrayOfTables(tables) => tables.get_mut(index).map(|t| t as &mut dyn TableLike),
        Item::Value(toml_edit::Value::Array(array)) => array
            .get_mut(index)?
            .as_inline_table_mut()
            .map(|t| t as &mut dyn TableLike),
        _ => None,
    }
}

// Keeps the key, spacing and trailing comment around an existing value.
fn write_switch(entry: &mut dyn TableLike, mode: SwitchMode) {
    if let Some(current) = entry.get_mut("switch").and_then(Item::as_value_mut) {
        let decor = current.decor().clone();
        *current = toml_edit::Value::from(mode.as_str());
        *current.decor_mut() = decor;
        return;
    }
    entry.insert("switch", value(mode.as_str()));
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
global_timeout = 30

[[probes]]
name = "p1"
command = "/usr/bin/p1"
param = "-t 5"
switch = "on"

[[probes]]
name = "p2"
switch = "off"   # keep quiet at night
command = ""
param = ""

[[extend_probes]]
name = "p3"
command = ""
param = ""
start_check = ""
check_type = "count"
switch = "auto"
owner = "ops"
"#;

    fn doc() -> ProbeConfigDocument {
        ProbeConfigDocument::parse(DOC).unwrap()
    }

    fn names(probes: &[Probe]) -> Vec<&str> {
        probes.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_switch_mode_parse() {
        assert_eq!("auto".parse::<SwitchMode>(), Ok(SwitchMode::Auto));
        assert!("ON".parse::<SwitchMode>().is_err());
        assert_eq!(SwitchMode::Off.to_string(), "off");
    }

    #[test]
    fn test_document_groups() {
        let doc = doc();
        assert_eq!(names(doc.base()), ["p1", "p2"]);
        assert_eq!(names(doc.extended()), ["p3"]);
        assert_eq!(doc.get("p1").unwrap().param, "-t 5");
    }

    #[test]
    fn test_supports_auto_follows_start_check() {
        let doc = doc();
        assert!(!doc.get("p1").unwrap().supports_auto());
        assert!(doc.get("p3").unwrap().supports_auto());
        assert_eq!(doc.get("p3").unwrap().check_type.as_deref(), Some("count"));
    }

    #[test]
    fn test_missing_base_section_is_empty() {
        let doc = ProbeConfigDocument::parse("[[extend_probes]]\nname = \"p3\"\nswitch = \"on\"\n").unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_entries_without_name_are_skipped() {
        let doc = ProbeConfigDocument::parse("[[probes]]\nswitch = \"on\"\n[[probes]]\nname = \"ok\"\n").unwrap();
        assert_eq!(names(doc.base()), ["ok"]);
        assert_eq!(doc.base()[0].switch(), SwitchMode::Off);
    }

    #[test]
    fn test_inline_array_section() {
        let mut doc = ProbeConfigDocument::parse(
            "probes = [{ name = \"p1\", switch = \"on\" }, { name = \"p2\", switch = \"off\" }]\n",
        )
        .unwrap();
        doc.probes_mut().find(|p| p.name == "p2").unwrap().set_switch(SwitchMode::On);
        assert_eq!(
            doc.render(),
            "probes = [{ name = \"p1\", switch = \"on\" }, { name = \"p2\", switch = \"on\" }]\n"
        );
    }

    #[test]
    fn test_unmodified_render_is_identical() {
        let doc = doc();
        assert!(!doc.has_changes());
        assert_eq!(doc.render(), DOC);
    }

    #[test]
    fn test_switch_updated_in_place() {
        let mut doc = doc();
        doc.probes_mut().find(|p| p.name == "p2").unwrap().set_switch(SwitchMode::On);
        assert!(doc.has_changes());

        let expected = DOC.replace("switch = \"off\"   # keep quiet at night", "switch = \"on\"   # keep quiet at night");
        assert_eq!(doc.render(), expected);
    }

    #[test]
    fn test_unparsable_switch_kept_until_changed() {
        let text = "[[probes]]\nname = \"p1\"\nswitch = \"ON\"\n\n[[probes]]\nname = \"p2\"\n";
        let mut doc = ProbeConfigDocument::parse(text).unwrap();
        assert_eq!(doc.get("p1").unwrap().switch(), SwitchMode::Off);
        assert_eq!(doc.render(), text);

        doc.probes_mut().find(|p| p.name == "p1").unwrap().set_switch(SwitchMode::Off);
        assert_eq!(doc.render(), text.replace("\"ON\"", "\"off\""));
    }

    #[test]
    fn test_new_document_lists_probes_in_order() {
        let doc = ProbeConfigDocument::new(
            vec![Probe::new("p1", SwitchMode::On)],
            vec![Probe::new("p3", SwitchMode::Off).with_start_check("", "count")],
        );
        let reparsed = ProbeConfigDocument::parse(&doc.render()).unwrap();
        assert_eq!(names(reparsed.base()), ["p1"]);
        assert_eq!(names(reparsed.extended()), ["p3"]);
        assert!(reparsed.get("p3").unwrap().supports_auto());
        assert!(!reparsed.has_changes());
    }
}
