/// Parser for Cobertura XML documents embedded in an upload envelope.
///
/// Cobertura XML structure:
///   <coverage version="..." timestamp="..." lines-valid="..." lines-covered="..."
///             line-rate="..." branches-valid="..." branches-covered="..."
///             branch-rate="..." complexity="...">
///     <sources><source>/abs/base/path</source></sources>
///     <packages>
///       <package name="...">
///         <classes>
///           <class name="..." filename="..." line-rate="..." branch-rate="..." complexity="...">
///             <methods>
///               <method name="...">
///                 <lines><line number="..." hits="..."/></lines>
///               </method>
///             </methods>
///             <lines>
///               <line number="..." hits="..."/>
///             </lines>
///           </class>
///         </classes>
///       </package>
///     </packages>
///   </coverage>
///
/// Only the class-level `<lines>` block is read; method blocks repeat the
/// same lines.
use std::collections::{BTreeMap, HashMap};
use std::str::{self, FromStr};

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::{RelayError, Result};
use crate::model::{CoverageData, FileCoverageData};
use crate::parsers::envelope::Manifest;

/// A `<class>` element before its filename is resolved against the manifest.
#[derive(Debug)]
struct RawClass {
    filename: String,
    coverage: FileCoverageData,
}

#[derive(Default)]
struct State {
    stack: Vec<Vec<u8>>,
    root: Option<CoverageData>,
    sources: Vec<String>,
    classes: Vec<RawClass>,
    current: Option<RawClass>,
}

impl State {
    fn parent(&self) -> Option<&[u8]> {
        self.stack.last().map(Vec::as_slice)
    }

    fn grandparent(&self) -> Option<&[u8]> {
        let len = self.stack.len();
        if len >= 2 {
            Some(self.stack[len - 2].as_slice())
        } else {
            None
        }
    }

    fn open(&mut self, e: &BytesStart) {
        let local = e.local_name();
        match local.as_ref() {
            b"coverage" if self.stack.is_empty() && self.root.is_none() => {
                self.root = Some(root_from_attrs(&attr_map(e)));
            }
            b"class" => {
                let attrs = attr_map(e);
                self.current = attrs.get("filename").map(|filename| RawClass {
                    filename: filename.clone(),
                    coverage: FileCoverageData {
                        line_rate: number(&attrs, "line-rate"),
                        branch_rate: number(&attrs, "branch-rate"),
                        complexity: number(&attrs, "complexity"),
                        lines: BTreeMap::new(),
                    },
                });
            }
            b"line"
                if self.parent() == Some(b"lines".as_slice())
                    && self.grandparent() == Some(b"class".as_slice()) =>
            {
                let attrs = attr_map(e);
                let Some(class) = self.current.as_mut() else {
                    return;
                };
                let line_number = attrs
                    .get("number")
                    .and_then(|n| n.trim().parse::<u32>().ok())
                    .filter(|n| *n > 0);
                if let Some(line_number) = line_number {
                    let hits: u64 = number(&attrs, "hits");
                    let entry = class.coverage.lines.entry(line_number).or_insert(0);
                    *entry = (*entry).max(hits);
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, local: &[u8]) {
        if local == b"class" {
            if let Some(class) = self.current.take() {
                self.classes.push(class);
            }
        }
    }

    fn text(&mut self, text: &str) {
        if self.parent() == Some(b"source".as_slice())
            && self.grandparent() == Some(b"sources".as_slice())
        {
            self.sources.push(text.to_string());
        }
    }
}

/// Parse one embedded Cobertura document, keeping only classes whose
/// filename resolves against the manifest.
pub fn parse_document(input: &[u8], manifest: &Manifest) -> Result<CoverageData> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(true);

    let mut state = State::default();
    let mut buf = Vec::new();

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(source) => {
                return Err(RelayError::Xml {
                    source,
                    position: reader.buffer_position(),
                })
            }
        };
        match event {
            Event::Eof => break,
            Event::Start(ref e) => {
                state.open(e);
                state.stack.push(e.local_name().as_ref().to_vec());
            }
            Event::Empty(ref e) => {
                state.open(e);
                state.close(e.local_name().as_ref());
            }
            Event::End(ref e) => {
                state.stack.pop();
                state.close(e.local_name().as_ref());
            }
            Event::Text(ref e) => {
                if let Ok(text) = e.unescape() {
                    state.text(&text);
                }
            }
            _ => {}
        }
        buf.clear();
    }

    if !state.stack.is_empty() {
        return Err(RelayError::Parse(format!(
            "Unexpected end of document inside <{}>",
            String::from_utf8_lossy(&state.stack[state.stack.len() - 1])
        )));
    }

    let mut data = state
        .root
        .ok_or_else(|| RelayError::Parse("Document has no <coverage> root".to_string()))?;

    let base_path = state
        .sources
        .iter()
        .map(|s| s.trim().trim_end_matches('/'))
        .find(|s| !s.is_empty())
        .unwrap_or("");

    for class in state.classes {
        let Some(path) = manifest.resolve(&class.filename, base_path) else {
            continue;
        };
        match data.file_coverage.get_mut(&path) {
            // Some generators split one file over several classes.
            Some(existing) => {
                for (line, hits) in class.coverage.lines {
                    let entry = existing.lines.entry(line).or_insert(0);
                    *entry = (*entry).max(hits);
                }
            }
            None => {
                data.file_coverage.insert(path, class.coverage);
            }
        }
    }

    Ok(data)
}

fn root_from_attrs(attrs: &HashMap<String, String>) -> CoverageData {
    CoverageData {
        version: attrs.get("version").cloned().unwrap_or_default(),
        timestamp: number(attrs, "timestamp"),
        lines_valid: number(attrs, "lines-valid"),
        lines_covered: number(attrs, "lines-covered"),
        line_rate: number(attrs, "line-rate"),
        branches_valid: number(attrs, "branches-valid"),
        branches_covered: number(attrs, "branches-covered"),
        branch_rate: number(attrs, "branch-rate"),
        complexity: number(attrs, "complexity"),
        file_coverage: BTreeMap::new(),
    }
}

/// Read a numeric attribute, falling back to the type's default when it is
/// absent or malformed.
fn number<T: FromStr + Default>(attrs: &HashMap<String, String>, key: &str) -> T {
    attrs
        .get(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or_default()
}

/// Extract attributes from an XML element into a HashMap.
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
