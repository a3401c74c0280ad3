// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reading XUnit (JUnit-style XML) reports.
//!
//! Reports are expected in pytest's `xunit1` family, where each `<testcase>` carries `file` and
//! `line` attributes alongside `classname` and `name`. Reports without `file` are accepted too: the
//! file is then inferred from the dotted `classname`.

use super::{TestOutcome, duration_from_secs};
use crate::{
    errors::ParseError,
    tree::{StableId, TestStatus},
};
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use tracing::warn;

/// Parses an XUnit report into outcomes, in document order.
///
/// A well-formed report without any `<testcase>` elements produces an empty list. A malformed
/// document produces an error. A `<testcase>` missing its `name` is logged and skipped.
pub fn parse(xml: &str) -> Result<Vec<TestOutcome>, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut outcomes = Vec::new();
    let mut open: Vec<String> = Vec::new();
    let mut saw_root = false;
    let mut current: Option<CaseBuilder> = None;

    loop {
        let event = reader.read_event().map_err(|err| ParseError::Xml {
            position: reader.error_position(),
            err,
        })?;
        match event {
            Event::Start(start) => {
                saw_root = true;
                let name = element_name(&start);
                match name.as_str() {
                    "testcase" => {
                        current = Some(CaseBuilder::new(&reader, &start)?);
                    }
                    "failure" | "error" | "skipped" => {
                        if let Some(case) = &mut current {
                            case.add_result(&reader, &name, &start, true)?;
                        }
                    }
                    _ => {}
                }
                open.push(name);
            }
            Event::Empty(start) => {
                saw_root = true;
                let name = element_name(&start);
                match name.as_str() {
                    "testcase" => {
                        CaseBuilder::new(&reader, &start)?.finish(&mut outcomes);
                    }
                    "failure" | "error" | "skipped" => {
                        if let Some(case) = &mut current {
                            case.add_result(&reader, &name, &start, false)?;
                        }
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                let name = open.pop().unwrap_or_default();
                match name.as_str() {
                    "testcase" => {
                        if let Some(case) = current.take() {
                            case.finish(&mut outcomes);
                        }
                    }
                    "failure" | "error" | "skipped" => {
                        if let Some(case) = &mut current {
                            case.capturing = false;
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(text) => {
                if let Some(case) = current.as_mut().filter(|case| case.capturing) {
                    let text = text.unescape().map_err(|err| ParseError::Xml {
                        position: reader.buffer_position(),
                        err: err.into(),
                    })?;
                    case.traceback.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(case) = current.as_mut().filter(|case| case.capturing) {
                    case.traceback.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = open.pop() {
        return Err(ParseError::UnexpectedEof { open });
    }
    if !saw_root {
        return Err(ParseError::NoRootElement);
    }
    Ok(outcomes)
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

/// Reads all attributes of `start`, unescaped.
fn attributes(
    reader: &Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> Result<Vec<(String, String)>, ParseError> {
    let xml_error = |err: quick_xml::Error| ParseError::Xml {
        position: reader.buffer_position(),
        err,
    };
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|err| xml_error(err.into()))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|err| xml_error(err.into()))?;
        attrs.push((key, value.into_owned()));
    }
    Ok(attrs)
}

fn find<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, value)| value.as_str())
}

#[derive(Debug)]
struct CaseBuilder {
    // None if the testcase had no name; it's dropped on finish.
    id: Option<StableId>,
    status: TestStatus,
    duration: Option<std::time::Duration>,
    line: Option<u32>,
    message: Option<String>,
    traceback: String,
    capturing: bool,
}

impl CaseBuilder {
    fn new(reader: &Reader<&[u8]>, start: &BytesStart<'_>) -> Result<Self, ParseError> {
        let attrs = attributes(reader, start)?;
        let id = find(&attrs, "name").map(|name| {
            reconstruct_id(
                find(&attrs, "file"),
                find(&attrs, "classname").unwrap_or_default(),
                name,
            )
        });
        let duration = find(&attrs, "time")
            .and_then(|time| time.trim().parse::<f64>().ok())
            .and_then(duration_from_secs);
        // pytest reports 0-based line numbers.
        let line = find(&attrs, "line")
            .and_then(|line| line.trim().parse::<u32>().ok())
            .map(|line| line.saturating_add(1));

        Ok(Self {
            id,
            status: TestStatus::Pass,
            duration,
            line,
            message: None,
            traceback: String::new(),
            capturing: false,
        })
    }

    fn add_result(
        &mut self,
        reader: &Reader<&[u8]>,
        element: &str,
        start: &BytesStart<'_>,
        has_body: bool,
    ) -> Result<(), ParseError> {
        let status = match element {
            "failure" => TestStatus::Fail,
            "error" => TestStatus::Error,
            _ => TestStatus::Skip,
        };
        // A test can fail and then error in teardown: keep the worst.
        if self.status == TestStatus::Pass || status.severity() > self.status.severity() {
            self.status = status;
            let attrs = attributes(reader, start)?;
            self.message = find(&attrs, "message").map(str::to_owned);
            self.traceback.clear();
            self.capturing = has_body;
        }
        Ok(())
    }

    fn finish(self, outcomes: &mut Vec<TestOutcome>) {
        let Some(id) = self.id else {
            warn!("{}", ParseError::MissingAttribute {
                element: "testcase",
                attribute: "name",
            });
            return;
        };
        let traceback = self.traceback.trim();
        outcomes.push(TestOutcome {
            id,
            status: self.status,
            duration: self.duration,
            message: self.message,
            traceback: (!traceback.is_empty()).then(|| traceback.to_owned()),
            line: self.line,
        });
    }
}

/// Rebuilds a stable id from a testcase's attributes.
fn reconstruct_id(file: Option<&str>, classname: &str, name: &str) -> StableId {
    let classname = classname.trim();
    let (file, classes): (String, Vec<&str>) = match file {
        Some(file) if !file.is_empty() => {
            let file = file.replace('\\', "/");
            let module = file
                .strip_suffix(".py")
                .unwrap_or(&file)
                .replace('/', ".");
            let classes = if classname == module {
                Vec::new()
            } else if let Some(rest) = classname
                .strip_prefix(module.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
            {
                rest.split('.').collect()
            } else {
                // The classname doesn't follow the file: fall back to inference.
                infer_classes(classname)
            };
            (file, classes)
        }
        _ => {
            let module_len = module_segments(classname);
            let segments: Vec<&str> = classname.split('.').filter(|s| !s.is_empty()).collect();
            let file = format!("{}.py", segments[..module_len].join("/"));
            (file, segments[module_len..].to_vec())
        }
    };

    let mut qualified = classes;
    qualified.push(name);
    StableId::for_member(camino::Utf8Path::new(&file), &qualified)
}

/// Returns the number of leading dotted segments that form the module path: everything up to
/// the first segment that looks like a class name.
fn module_segments(classname: &str) -> usize {
    let segments: Vec<&str> = classname.split('.').filter(|s| !s.is_empty()).collect();
    segments
        .iter()
        .position(|segment| segment.starts_with(|c: char| c.is_ascii_uppercase()))
        .unwrap_or(segments.len())
}

fn infer_classes(classname: &str) -> Vec<&str> {
    let module_len = module_segments(classname);
    classname
        .split('.')
        .filter(|s| !s.is_empty())
        .skip(module_len)
        .collect()
}
