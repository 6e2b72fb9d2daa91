//! In-memory model of the Cobertura coverage format. The UCDB reader
//! populates a `Coverage`, which then serializes itself to the
//! `coverage → packages → package → classes → class → lines` XML shape
//! understood by CI coverage dashboards.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use chrono::Utc;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::writer::Writer;

use crate::error::{ConvertError, Result};

/// Compute a line rate. A scope with nothing instrumentable reports as
/// fully covered, so zero valid lines yields 1.0 rather than an error.
#[must_use]
pub fn rate(covered: u64, valid: u64) -> f64 {
    if valid == 0 {
        1.0
    } else {
        covered as f64 / valid as f64
    }
}

fn format_rate(value: f64) -> String {
    format!("{value}")
}

/// One source file in the report. Cobertura is Java-oriented, so the file
/// doubles as the "class"; `name` and `filename` carry the same path.
#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub source_file: String,
    /// Line number → hit count, one entry per instrumentable line.
    pub lines: BTreeMap<u32, u64>,
    pub lines_valid: u64,
    pub lines_covered: u64,
}

impl Class {
    #[must_use]
    pub fn new(name: String, source_file: String) -> Self {
        Self {
            name,
            source_file,
            lines: BTreeMap::new(),
            lines_valid: 0,
            lines_covered: 0,
        }
    }

    /// Record one instrumentable line. A line number may only be added
    /// once per class; a duplicate signals broken grouping upstream.
    pub fn add_statement(&mut self, line: u32, hits: u64) -> Result<()> {
        if self.lines.contains_key(&line) {
            return Err(ConvertError::DuplicateLine {
                class: self.name.clone(),
                line,
            });
        }

        self.lines.insert(line, hits);
        self.lines_valid += 1;

        if hits > 0 {
            self.lines_covered += 1;
        }

        Ok(())
    }

    #[must_use]
    pub fn line_rate(&self) -> f64 {
        rate(self.lines_covered, self.lines_valid)
    }

    fn write_xml<W: Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let line_rate = format_rate(self.line_rate());

        let mut class_node = BytesStart::new("class");
        class_node.push_attribute(("name", self.source_file.as_str()));
        class_node.push_attribute(("filename", self.source_file.as_str()));
        class_node.push_attribute(("complexity", "0"));
        class_node.push_attribute(("branch-rate", "0"));
        class_node.push_attribute(("line-rate", line_rate.as_str()));
        writer.write_event(Event::Start(class_node))?;

        writer.write_event(Event::Empty(BytesStart::new("methods")))?;

        writer.write_event(Event::Start(BytesStart::new("lines")))?;
        for (number, hits) in &self.lines {
            let number = number.to_string();
            let hits = hits.to_string();
            let mut line_node = BytesStart::new("line");
            line_node.push_attribute(("number", number.as_str()));
            line_node.push_attribute(("hits", hits.as_str()));
            writer.write_event(Event::Empty(line_node))?;
        }
        writer.write_event(Event::End(BytesEnd::new("lines")))?;

        writer.write_event(Event::End(BytesEnd::new("class")))?;
        Ok(())
    }
}

/// A grouping of classes. The UCDB reader creates one package per source
/// file, named by the file path.
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub classes: BTreeMap<String, Class>,
    pub lines_valid: u64,
    pub lines_covered: u64,
}

impl Package {
    #[must_use]
    pub fn new(name: String) -> Self {
        Self {
            name,
            classes: BTreeMap::new(),
            lines_valid: 0,
            lines_covered: 0,
        }
    }

    pub fn add_class(&mut self, class: Class) -> Result<()> {
        if self.classes.contains_key(&class.name) {
            return Err(ConvertError::DuplicateClass(class.name));
        }

        self.classes.insert(class.name.clone(), class);
        Ok(())
    }

    pub fn refresh_statistics(&mut self) {
        self.lines_valid = 0;
        self.lines_covered = 0;

        for class in self.classes.values() {
            self.lines_valid += class.lines_valid;
            self.lines_covered += class.lines_covered;
        }
    }

    #[must_use]
    pub fn line_rate(&self) -> f64 {
        rate(self.lines_covered, self.lines_valid)
    }

    fn write_xml<W: Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let line_rate = format_rate(self.line_rate());

        let mut package_node = BytesStart::new("package");
        package_node.push_attribute(("name", self.name.as_str()));
        package_node.push_attribute(("complexity", "0"));
        package_node.push_attribute(("branch-rate", "0"));
        package_node.push_attribute(("line-rate", line_rate.as_str()));
        writer.write_event(Event::Start(package_node))?;

        writer.write_event(Event::Start(BytesStart::new("classes")))?;
        for class in self.classes.values() {
            class.write_xml(writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new("classes")))?;

        writer.write_event(Event::End(BytesEnd::new("package")))?;
        Ok(())
    }
}

/// Root of the Cobertura model: registered source roots plus the package
/// tree. Aggregate counters are derived and must be recomputed via
/// `refresh_statistics` before they are read; `to_xml` does so itself.
#[derive(Debug, Clone, Default)]
pub struct Coverage {
    pub sources: BTreeSet<String>,
    pub packages: BTreeMap<String, Package>,
    pub lines_valid: u64,
    pub lines_covered: u64,
}

impl Coverage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, source: String) {
        self.sources.insert(source);
    }

    pub fn add_package(&mut self, package: Package) -> Result<()> {
        if self.packages.contains_key(&package.name) {
            return Err(ConvertError::DuplicatePackage(package.name));
        }

        self.packages.insert(package.name.clone(), package);
        Ok(())
    }

    pub fn refresh_statistics(&mut self) {
        self.lines_valid = 0;
        self.lines_covered = 0;

        for package in self.packages.values_mut() {
            package.refresh_statistics();
            self.lines_valid += package.lines_valid;
            self.lines_covered += package.lines_covered;
        }
    }

    #[must_use]
    pub fn line_rate(&self) -> f64 {
        rate(self.lines_covered, self.lines_valid)
    }

    /// Serialize the model as a pretty-printed Cobertura XML document.
    /// Statistics are recomputed first so derived attributes are never
    /// stale.
    pub fn to_xml(&mut self) -> Result<Vec<u8>> {
        self.refresh_statistics();

        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

        let timestamp = Utc::now().timestamp().to_string();
        let lines_valid = self.lines_valid.to_string();
        let lines_covered = self.lines_covered.to_string();
        let line_rate = format_rate(self.line_rate());

        let mut coverage_node = BytesStart::new("coverage");
        coverage_node.push_attribute(("version", "5.5"));
        coverage_node.push_attribute(("timestamp", timestamp.as_str()));
        coverage_node.push_attribute(("branches-valid", "0"));
        coverage_node.push_attribute(("branches-covered", "0"));
        coverage_node.push_attribute(("branch-rate", "0"));
        coverage_node.push_attribute(("complexity", "0"));
        coverage_node.push_attribute(("lines-valid", lines_valid.as_str()));
        coverage_node.push_attribute(("lines-covered", lines_covered.as_str()));
        coverage_node.push_attribute(("line-rate", line_rate.as_str()));
        writer.write_event(Event::Start(coverage_node))?;

        writer.write_event(Event::Start(BytesStart::new("sources")))?;
        for source in &self.sources {
            writer.write_event(Event::Start(BytesStart::new("source")))?;
            writer.write_event(Event::Text(BytesText::new(source)))?;
            writer.write_event(Event::End(BytesEnd::new("source")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("sources")))?;

        writer.write_event(Event::Start(BytesStart::new("packages")))?;
        for package in self.packages.values() {
            package.write_xml(&mut writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new("packages")))?;

        writer.write_event(Event::End(BytesEnd::new("coverage")))?;

        Ok(writer.into_inner())
    }
}
