//! Reader for UCDB/UCIS XML exports (as produced by e.g. `acdb2xml`).
//!
//! UCDB XML structure (namespace prefix varies by exporter, so elements
//! are matched by local name):
//!   <ux:ucdb>
//!     <ux:scope type="INSTANCE" name="...">
//!       <ux:bin type="STMTBIN" flags="00000000">
//!         <ux:src file="..." line="..." workdir="..."/>
//!         <ux:count>3</ux:count>
//!         <ux:attr key="#SINDEX#">1</ux:attr>
//!       </ux:bin>
//!       <ux:scope ...>...</ux:scope>
//!     </ux:scope>
//!   </ux:ucdb>
//!
//! The reader walks the scope tree, collects statement bins, applies the
//! exclusion-flag policy, optionally merges multiply-instantiated
//! statements, and aggregates per-line hits into a Cobertura model.

use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use std::str;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::cobertura::{Class, Coverage, Package};
use crate::error::{ConvertError, Result};

/// Statement excluded by a coverage pragma in the source.
pub const UCDB_EXCLUDE_PRAGMA: u32 = 0x0000_0020;
/// Statement excluded because its whole source file is excluded.
pub const UCDB_EXCLUDE_FILE: u32 = 0x0000_0040;
/// Statement excluded for one specific instance.
pub const UCDB_EXCLUDE_INST: u32 = 0x0000_0080;
/// Statement excluded automatically by the simulator.
pub const UCDB_EXCLUDE_AUTO: u32 = 0x0000_0100;

/// A statement whose flags intersect this mask is dropped from the
/// accounting, though its file still appears in the report.
pub const UCDB_EXCLUDED: u32 =
    UCDB_EXCLUDE_FILE | UCDB_EXCLUDE_PRAGMA | UCDB_EXCLUDE_INST | UCDB_EXCLUDE_AUTO;

/// One raw occurrence of a statement bin in the UCDB tree.
#[derive(Debug, Clone)]
struct StatementFact {
    file: String,
    line: u32,
    /// Statement index within the line; identical indices across instances
    /// denote the same logical statement.
    index: u32,
    /// Dot-joined scope path, root first. Used in diagnostics only.
    instance: String,
    hits: u64,
}

/// Result of one UCDB conversion: the populated Cobertura model plus the
/// statement-level tallies (line tallies live on the model itself).
#[derive(Debug)]
pub struct ParseOutcome {
    pub coverage: Coverage,
    pub statements_count: u64,
    pub statements_covered: u64,
}

/// Parse a UCDB XML document into a Cobertura coverage model.
///
/// With `merge_instances` set, statement occurrences that share a statement
/// index on the same line (replicas from multiple instantiations of one
/// design unit) collapse into a single logical statement that counts as hit
/// when any replica executed.
pub fn parse(input: &[u8], merge_instances: bool) -> Result<ParseOutcome> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(true);

    let mut coverage = Coverage::new();

    // file → line → raw statement occurrences. Files seen only through
    // excluded statements keep an empty entry so they still get a class.
    let mut statements: BTreeMap<String, BTreeMap<u32, Vec<StatementFact>>> = BTreeMap::new();

    let mut scopes: Vec<String> = Vec::new();
    let mut buf = Vec::new();
    let mut skip_buf = Vec::new();

    loop {
        let position = reader.buffer_position();
        match reader.read_event_into(&mut buf) {
            Err(source) => return Err(ConvertError::Xml { source, position }),
            Ok(Event::Eof) => break,
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"scope" => {
                    let attrs = attr_map(e);
                    let scope_type = require_attr(&attrs, "type", "scope")?;
                    let name = require_attr(&attrs, "name", "scope")?;

                    if scope_type.starts_with("DU_") {
                        // Design-unit declaration scopes duplicate the bins
                        // already counted under their instantiations.
                        let end = e.to_end().into_owned();
                        reader
                            .read_to_end_into(end.name(), &mut skip_buf)
                            .map_err(|source| ConvertError::Xml { source, position })?;
                    } else {
                        scopes.push(name);
                    }
                }
                b"bin" => {
                    let attrs = attr_map(e);
                    let bin_type = require_attr(&attrs, "type", "bin")?;

                    if bin_type == "STMTBIN" {
                        let flags = parse_flags(&require_attr(&attrs, "flags", "bin")?)?;
                        let (workdir, fact) = parse_statement_bin(&mut reader, &scopes)?;
                        coverage.add_source(workdir);

                        if flags & UCDB_EXCLUDED != 0 {
                            statements.entry(fact.file).or_default();
                        } else {
                            statements
                                .entry(fact.file.clone())
                                .or_default()
                                .entry(fact.line)
                                .or_default()
                                .push(fact);
                        }
                    } else {
                        let end = e.to_end().into_owned();
                        reader
                            .read_to_end_into(end.name(), &mut skip_buf)
                            .map_err(|source| ConvertError::Xml { source, position })?;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"bin" {
                    let attrs = attr_map(e);
                    if require_attr(&attrs, "type", "bin")? == "STMTBIN" {
                        return Err(ConvertError::Malformed(format!(
                            "statement bin in instance '{}' has no source location",
                            scopes.join(".")
                        )));
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.local_name().as_ref() == b"scope" {
                    scopes.pop();
                }
            }
            Ok(_) => {}
        }
        buf.clear();
    }

    let mut statements_count: u64 = 0;
    let mut statements_covered: u64 = 0;

    for (file, lines) in statements {
        let mut class = Class::new(file.clone(), file.clone());

        for (line, mut facts) in lines {
            debug_assert!(
                facts.iter().all(|fact| fact.file == file && fact.line == line),
                "statement group mixes sources (first instance: '{}')",
                facts[0].instance
            );

            if merge_instances {
                facts = merge_by_index(&facts);
            }

            let covered = facts.iter().filter(|fact| fact.hits > 0).count();
            statements_count += facts.len() as u64;
            statements_covered += covered as u64;

            // A line only counts as hit when every statement occurrence
            // attributed to it executed.
            let hit = u64::from(covered == facts.len());
            class.add_statement(line, hit)?;
        }

        let mut package = Package::new(file.clone());
        package.add_class(class)?;
        coverage.add_package(package)?;
    }

    Ok(ParseOutcome {
        coverage,
        statements_count,
        statements_covered,
    })
}

/// Collapse occurrences of the same statement index into one synthetic
/// fact per index. A merged statement counts as hit when any of its
/// instances executed.
fn merge_by_index(facts: &[StatementFact]) -> Vec<StatementFact> {
    let mut hit_by_index: BTreeMap<u32, bool> = BTreeMap::new();

    for fact in facts {
        let hit = hit_by_index.entry(fact.index).or_insert(false);
        *hit = *hit || fact.hits > 0;
    }

    hit_by_index
        .into_iter()
        .map(|(index, hit)| StatementFact {
            file: facts[0].file.clone(),
            line: facts[0].line,
            index,
            instance: String::new(),
            hits: u64::from(hit),
        })
        .collect()
}

/// Parse the children of a `<bin type="STMTBIN">` element up to its closing
/// tag. Returns the `workdir` source root and the statement data.
fn parse_statement_bin<R: BufRead>(
    reader: &mut Reader<R>,
    scopes: &[String],
) -> Result<(String, StatementFact)> {
    enum Capture {
        None,
        Count,
        Index,
    }

    let instance = scopes.join(".");

    let mut file: Option<String> = None;
    let mut line: Option<u32> = None;
    let mut workdir: Option<String> = None;
    let mut count: Option<u64> = None;
    let mut index: Option<u32> = None;

    let mut capture = Capture::None;
    let mut depth = 0usize;
    let mut buf = Vec::new();

    loop {
        let position = reader.buffer_position();
        match reader.read_event_into(&mut buf) {
            Err(source) => return Err(ConvertError::Xml { source, position }),
            Ok(Event::Eof) => {
                return Err(ConvertError::Malformed(format!(
                    "unterminated statement bin in instance '{instance}'"
                )));
            }
            Ok(Event::Start(ref e)) => {
                match e.local_name().as_ref() {
                    b"src" => read_src(e, &mut file, &mut line, &mut workdir, &instance)?,
                    b"count" => capture = Capture::Count,
                    b"attr" => {
                        let attrs = attr_map(e);
                        if attrs.get("key").map(String::as_str) == Some("#SINDEX#") {
                            capture = Capture::Index;
                        }
                    }
                    _ => {}
                }
                depth += 1;
            }
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"src" {
                    read_src(e, &mut file, &mut line, &mut workdir, &instance)?;
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|source| ConvertError::Xml { source, position })?;
                match capture {
                    Capture::Count => {
                        count = Some(text.trim().parse().map_err(|_| {
                            ConvertError::Malformed(format!(
                                "invalid statement count '{text}' in instance '{instance}'"
                            ))
                        })?);
                    }
                    Capture::Index => {
                        index = Some(text.trim().parse().map_err(|_| {
                            ConvertError::Malformed(format!(
                                "invalid statement index '{text}' in instance '{instance}'"
                            ))
                        })?);
                    }
                    Capture::None => {}
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
                capture = Capture::None;
            }
            Ok(_) => {}
        }
        buf.clear();
    }

    let fact = StatementFact {
        file: file.ok_or_else(|| missing_child("src element", &instance))?,
        line: line.ok_or_else(|| missing_child("line attribute", &instance))?,
        index: index.ok_or_else(|| missing_child("#SINDEX# attribute", &instance))?,
        instance: instance.clone(),
        hits: count.ok_or_else(|| missing_child("count element", &instance))?,
    };
    let workdir = workdir.ok_or_else(|| missing_child("workdir attribute", &instance))?;

    Ok((workdir, fact))
}

fn read_src(
    e: &BytesStart,
    file: &mut Option<String>,
    line: &mut Option<u32>,
    workdir: &mut Option<String>,
    instance: &str,
) -> Result<()> {
    let attrs = attr_map(e);

    *file = Some(require_attr(&attrs, "file", "src")?);
    *workdir = Some(require_attr(&attrs, "workdir", "src")?);

    let raw_line = require_attr(&attrs, "line", "src")?;
    *line = Some(raw_line.parse().map_err(|_| {
        ConvertError::Malformed(format!(
            "invalid line number '{raw_line}' in instance '{instance}'"
        ))
    })?);

    Ok(())
}

fn missing_child(what: &str, instance: &str) -> ConvertError {
    ConvertError::Malformed(format!(
        "statement bin in instance '{instance}' is missing its {what}"
    ))
}

/// Bin flags are serialized as a hexadecimal bitmask, with or without a
/// leading `0x`.
fn parse_flags(raw: &str) -> Result<u32> {
    let digits = raw.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);

    u32::from_str_radix(digits, 16)
        .map_err(|_| ConvertError::Malformed(format!("invalid bin flags '{raw}'")))
}

/// Extract attributes from an XML element into a HashMap, ignoring any
/// namespace prefix on the attribute names.
fn attr_map(e: &BytesStart) -> HashMap<String, String> {
    e.attributes()
        .filter_map(|a| {
            let attr = a.ok()?;
            let key = str::from_utf8(attr.key.local_name().into_inner())
                .ok()?
                .to_string();
            let value = attr.unescape_value().ok()?.to_string();
            Some((key, value))
        })
        .collect()
}

fn require_attr(attrs: &HashMap<String, String>, name: &str, element: &str) -> Result<String> {
    attrs.get(name).cloned().ok_or_else(|| {
        ConvertError::Malformed(format!(
            "'{element}' element is missing its '{name}' attribute"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIPLE_INSTANCES: &[u8] =
        include_bytes!("../tests/fixtures/ucdb_multiple_instances.xml");
    const PARTIALLY_EXCLUDED: &[u8] =
        include_bytes!("../tests/fixtures/ucdb_partially_excluded.xml");
    const ALL_EXCLUDED: &[u8] = include_bytes!("../tests/fixtures/ucdb_all_excluded.xml");
    const NO_STATEMENTS: &[u8] = include_bytes!("../tests/fixtures/ucdb_no_statements.xml");

    fn parse_refreshed(input: &[u8], merge_instances: bool) -> ParseOutcome {
        let mut outcome = parse(input, merge_instances).unwrap();
        outcome.coverage.refresh_statistics();
        outcome
    }

    #[test]
    fn test_multiple_instances_without_merge() {
        let outcome = parse_refreshed(MULTIPLE_INSTANCES, false);

        assert_eq!(outcome.statements_count, 15);
        assert_eq!(outcome.statements_covered, 14);
        assert_eq!(outcome.coverage.lines_valid, 7);
        assert_eq!(outcome.coverage.lines_covered, 6);

        // One package+class per source file, keyed by the file path.
        let packages: Vec<_> = outcome.coverage.packages.keys().cloned().collect();
        assert_eq!(packages, vec!["adder.vhdl", "tb.vhdl"]);
        assert!(outcome.coverage.sources.contains("/work/project"));

        // The design-unit declaration scope duplicates the adder bins and
        // must not double-count them.
        let adder = &outcome.coverage.packages["adder.vhdl"].classes["adder.vhdl"];
        assert_eq!(adder.lines_valid, 4);
        assert_eq!(adder.lines_covered, 4);

        // tb.vhdl line 6 never executed.
        let tb = &outcome.coverage.packages["tb.vhdl"].classes["tb.vhdl"];
        assert_eq!(tb.lines_valid, 3);
        assert_eq!(tb.lines_covered, 2);
        assert_eq!(tb.lines[&6], 0);
    }

    #[test]
    fn test_multiple_instances_with_merge() {
        let outcome = parse_refreshed(MULTIPLE_INSTANCES, true);

        assert_eq!(outcome.statements_count, 9);
        assert_eq!(outcome.statements_covered, 8);
        // Merging never changes the line-level tallies.
        assert_eq!(outcome.coverage.lines_valid, 7);
        assert_eq!(outcome.coverage.lines_covered, 6);
    }

    #[test]
    fn test_partially_excluded() {
        for merge_instances in [false, true] {
            let outcome = parse_refreshed(PARTIALLY_EXCLUDED, merge_instances);

            assert_eq!(outcome.statements_count, 5);
            assert_eq!(outcome.statements_covered, 4);
            assert_eq!(outcome.coverage.lines_valid, 5);
            assert_eq!(outcome.coverage.lines_covered, 4);

            let class = &outcome.coverage.packages["ctrl.vhdl"].classes["ctrl.vhdl"];
            assert_eq!(class.lines.len(), 5);
            // Excluded statements on lines 25/26 contribute no entries.
            assert!(!class.lines.contains_key(&25));
            assert!(!class.lines.contains_key(&26));
        }
    }

    #[test]
    fn test_all_excluded_keeps_empty_class() {
        for merge_instances in [false, true] {
            let outcome = parse_refreshed(ALL_EXCLUDED, merge_instances);

            assert_eq!(outcome.statements_count, 0);
            assert_eq!(outcome.statements_covered, 0);
            assert_eq!(outcome.coverage.lines_valid, 0);
            assert_eq!(outcome.coverage.lines_covered, 0);

            // The file still appears, as an empty class.
            let class = &outcome.coverage.packages["ctrl.vhdl"].classes["ctrl.vhdl"];
            assert!(class.lines.is_empty());
            assert_eq!(class.line_rate(), 1.0);

            // Its workdir is still registered as a source root.
            assert!(outcome.coverage.sources.contains("/work/project"));
        }
    }

    #[test]
    fn test_no_statement_bins() {
        let outcome = parse_refreshed(NO_STATEMENTS, false);

        assert_eq!(outcome.statements_count, 0);
        assert_eq!(outcome.statements_covered, 0);
        assert_eq!(outcome.coverage.lines_valid, 0);
        assert_eq!(outcome.coverage.lines_covered, 0);
        assert!(outcome.coverage.packages.is_empty());
        assert_eq!(outcome.coverage.line_rate(), 1.0);
    }

    #[test]
    fn test_line_hit_requires_every_occurrence() {
        // Three statements on one line, hits [1, 1, 0]: the line reports
        // as missed even though two of three occurrences executed.
        let xml = br##"<?xml version="1.0"?>
<ux:ucdb xmlns:ux="UCIS">
  <ux:scope type="INSTANCE" name="dut">
    <ux:bin type="STMTBIN" flags="00000000">
      <ux:src file="a.vhdl" line="8" workdir="/work"/>
      <ux:count>1</ux:count>
      <ux:attr key="#SINDEX#">1</ux:attr>
    </ux:bin>
    <ux:bin type="STMTBIN" flags="00000000">
      <ux:src file="a.vhdl" line="8" workdir="/work"/>
      <ux:count>1</ux:count>
      <ux:attr key="#SINDEX#">2</ux:attr>
    </ux:bin>
    <ux:bin type="STMTBIN" flags="00000000">
      <ux:src file="a.vhdl" line="8" workdir="/work"/>
      <ux:count>0</ux:count>
      <ux:attr key="#SINDEX#">3</ux:attr>
    </ux:bin>
  </ux:scope>
</ux:ucdb>"##;

        let outcome = parse_refreshed(xml, false);

        assert_eq!(outcome.statements_count, 3);
        assert_eq!(outcome.statements_covered, 2);
        assert_eq!(outcome.coverage.lines_valid, 1);
        assert_eq!(outcome.coverage.lines_covered, 0);
        assert_eq!(
            outcome.coverage.packages["a.vhdl"].classes["a.vhdl"].lines[&8],
            0
        );
    }

    #[test]
    fn test_merge_collapses_shared_indices() {
        let facts = vec![
            StatementFact {
                file: "a.vhdl".to_string(),
                line: 4,
                index: 1,
                instance: "top.u1".to_string(),
                hits: 0,
            },
            StatementFact {
                file: "a.vhdl".to_string(),
                line: 4,
                index: 1,
                instance: "top.u2".to_string(),
                hits: 5,
            },
            StatementFact {
                file: "a.vhdl".to_string(),
                line: 4,
                index: 2,
                instance: "top.u1".to_string(),
                hits: 0,
            },
        ];

        let merged = merge_by_index(&facts);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].index, 1);
        assert_eq!(merged[0].hits, 1);
        assert_eq!(merged[1].index, 2);
        assert_eq!(merged[1].hits, 0);
    }

    #[test]
    fn test_flags_accept_0x_prefix() {
        assert_eq!(parse_flags("00000040").unwrap(), UCDB_EXCLUDE_FILE);
        assert_eq!(parse_flags("0x00000040").unwrap(), UCDB_EXCLUDE_FILE);
        assert_eq!(parse_flags("0X20").unwrap(), UCDB_EXCLUDE_PRAGMA);
        assert!(parse_flags("zz").is_err());

        let xml = br##"<?xml version="1.0"?>
<ux:ucdb xmlns:ux="UCIS">
  <ux:scope type="INSTANCE" name="dut">
    <ux:bin type="STMTBIN" flags="0x00000040">
      <ux:src file="a.vhdl" line="1" workdir="/work"/>
      <ux:count>2</ux:count>
      <ux:attr key="#SINDEX#">1</ux:attr>
    </ux:bin>
  </ux:scope>
</ux:ucdb>"##;

        let outcome = parse_refreshed(xml, false);
        assert_eq!(outcome.statements_count, 0);
        assert!(outcome.coverage.packages["a.vhdl"].classes["a.vhdl"]
            .lines
            .is_empty());
    }

    #[test]
    fn test_missing_flags_is_fatal() {
        let xml = br##"<?xml version="1.0"?>
<ux:ucdb xmlns:ux="UCIS">
  <ux:scope type="INSTANCE" name="dut">
    <ux:bin type="STMTBIN">
      <ux:src file="a.vhdl" line="1" workdir="/work"/>
      <ux:count>2</ux:count>
      <ux:attr key="#SINDEX#">1</ux:attr>
    </ux:bin>
  </ux:scope>
</ux:ucdb>"##;

        let err = parse(xml, false).unwrap_err();
        assert!(matches!(err, ConvertError::Malformed(_)));
        assert!(err.to_string().contains("flags"));
    }

    #[test]
    fn test_missing_scope_type_is_fatal() {
        let xml = br#"<?xml version="1.0"?>
<ux:ucdb xmlns:ux="UCIS">
  <ux:scope name="dut">
  </ux:scope>
</ux:ucdb>"#;

        let err = parse(xml, false).unwrap_err();
        assert!(matches!(err, ConvertError::Malformed(_)));
    }

    #[test]
    fn test_invalid_count_reports_instance_path() {
        let xml = br##"<?xml version="1.0"?>
<ux:ucdb xmlns:ux="UCIS">
  <ux:scope type="INSTANCE" name="top">
    <ux:scope type="INSTANCE" name="u1">
      <ux:bin type="STMTBIN" flags="00000000">
        <ux:src file="a.vhdl" line="1" workdir="/work"/>
        <ux:count>often</ux:count>
        <ux:attr key="#SINDEX#">1</ux:attr>
      </ux:bin>
    </ux:scope>
  </ux:scope>
</ux:ucdb>"##;

        let err = parse(xml, false).unwrap_err();
        assert!(err.to_string().contains("top.u1"));
    }

    #[test]
    fn test_du_only_document_yields_nothing() {
        let xml = br##"<?xml version="1.0"?>
<ux:ucdb xmlns:ux="UCIS">
  <ux:scope type="DU_MODULE" name="adder">
    <ux:bin type="STMTBIN" flags="00000000">
      <ux:src file="adder.vhdl" line="10" workdir="/work"/>
      <ux:count>3</ux:count>
      <ux:attr key="#SINDEX#">1</ux:attr>
    </ux:bin>
  </ux:scope>
</ux:ucdb>"##;

        let outcome = parse_refreshed(xml, false);
        assert_eq!(outcome.statements_count, 0);
        assert!(outcome.coverage.packages.is_empty());
        assert!(outcome.coverage.sources.is_empty());
    }

    #[test]
    fn test_non_statement_bins_are_ignored() {
        let xml = br##"<?xml version="1.0"?>
<ux:ucdb xmlns:ux="UCIS">
  <ux:scope type="INSTANCE" name="dut">
    <ux:bin type="BRANCHBIN" flags="00000000">
      <ux:src file="a.vhdl" line="3" workdir="/work"/>
      <ux:count>7</ux:count>
    </ux:bin>
    <ux:bin type="STMTBIN" flags="00000000">
      <ux:src file="a.vhdl" line="4" workdir="/work"/>
      <ux:count>7</ux:count>
      <ux:attr key="#SINDEX#">1</ux:attr>
    </ux:bin>
  </ux:scope>
</ux:ucdb>"##;

        let outcome = parse_refreshed(xml, false);
        assert_eq!(outcome.statements_count, 1);
        assert_eq!(outcome.coverage.lines_valid, 1);
        let class = &outcome.coverage.packages["a.vhdl"].classes["a.vhdl"];
        assert!(!class.lines.contains_key(&3));
        assert!(class.lines.contains_key(&4));
    }
}
