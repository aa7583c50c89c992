//! Canonical XML form of a model tree.
//!
//! This is the only persistent representation of a graph: model name and
//! type, the port lists, the submodels (recursively), then the connection
//! blocks in *output, input, internal* order. The emitter is canonical —
//! one tag per line, no indentation, deterministic ordering — so
//! write → parse → write is byte-identical for any valid tree.

use thiserror::Error;

use crate::graph::{GraphError, ModelGraph, ModelKind};
use crate::types::ModelId;

/// Errors raised while parsing the canonical form.
#[derive(Error, Debug)]
pub enum XmlError {
    #[error("unexpected end of document")]
    UnexpectedEof,

    #[error("line {line}: found `{found}`, expected {expected}")]
    Unexpected {
        line: usize,
        found: String,
        expected: String,
    },

    #[error("line {line}: unknown model type `{kind}`")]
    UnknownType { line: usize, kind: String },

    #[error("line {line}: missing attribute `{attr}`")]
    MissingAttr { line: usize, attr: &'static str },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ----------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------

/// Serializes the whole tree from the root.
pub fn to_xml(graph: &ModelGraph) -> String {
    let mut out = String::new();
    write_model(graph, graph.root(), &mut out);
    out
}

fn kind_name(graph: &ModelGraph, id: ModelId) -> &'static str {
    match graph.kind(id) {
        Some(ModelKind::Atomic) => "atomic",
        Some(ModelKind::Coupled(_)) => "coupled",
        _ => "opaque",
    }
}

fn write_model(graph: &ModelGraph, id: ModelId, out: &mut String) {
    let name = graph.name(id).unwrap_or("");
    out.push_str(&format!(
        "<model name=\"{}\" type=\"{}\">\n",
        escape(name),
        kind_name(graph, id)
    ));

    out.push_str("<in>\n");
    for port in graph.input_ports(id) {
        out.push_str(&format!("<port name=\"{}\"/>\n", escape(port.name())));
    }
    out.push_str("</in>\n");

    out.push_str("<out>\n");
    for port in graph.output_ports(id) {
        out.push_str(&format!("<port name=\"{}\"/>\n", escape(port.name())));
    }
    out.push_str("</out>\n");

    if graph.is_coupled(id) {
        out.push_str("<submodels>\n");
        for &child in graph.children(id) {
            write_model(graph, child, out);
        }
        out.push_str("</submodels>\n");

        out.push_str("<connections>\n");
        write_connections(graph, id, out);
        out.push_str("</connections>\n");
    }

    out.push_str("</model>\n");
}

fn write_connection(out: &mut String, kind: &str, origin: (&str, &str), destination: (&str, &str)) {
    out.push_str(&format!("<connection type=\"{kind}\">\n"));
    out.push_str(&format!(
        "<origin model=\"{}\" port=\"{}\"/>\n",
        escape(origin.0),
        escape(origin.1)
    ));
    out.push_str(&format!(
        "<destination model=\"{}\" port=\"{}\"/>\n",
        escape(destination.0),
        escape(destination.1)
    ));
    out.push_str("</connection>\n");
}

fn write_connections(graph: &ModelGraph, id: ModelId, out: &mut String) {
    let own_name = graph.name(id).unwrap_or("");

    // Output couplings: child output ports feeding this model's outputs.
    for port in graph.internal_output_ports(id) {
        for (child, child_port) in port.peers() {
            let child_name = graph.name(*child).unwrap_or("");
            write_connection(
                out,
                "output",
                (child_name, child_port),
                (own_name, port.name()),
            );
        }
    }

    // Input couplings: this model's inputs feeding child inputs.
    for port in graph.internal_input_ports(id) {
        for (child, child_port) in port.peers() {
            let child_name = graph.name(*child).unwrap_or("");
            write_connection(
                out,
                "input",
                (own_name, port.name()),
                (child_name, child_port),
            );
        }
    }

    // Internal couplings: child outputs feeding sibling inputs.
    for &child in graph.children(id) {
        let child_name = graph.name(child).unwrap_or("");
        for port in graph.output_ports(child) {
            for (peer, peer_port) in port.peers() {
                if *peer == id {
                    continue;
                }
                let peer_name = graph.name(*peer).unwrap_or("");
                write_connection(
                    out,
                    "internal",
                    (child_name, port.name()),
                    (peer_name, peer_port),
                );
            }
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

// ----------------------------------------------------------------------
// Parser
// ----------------------------------------------------------------------

struct Lines<'a> {
    lines: Vec<&'a str>,
    index: usize,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect(),
            index: 0,
        }
    }

    fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.index).copied()
    }

    fn next(&mut self) -> Result<&'a str, XmlError> {
        let line = self.lines.get(self.index).ok_or(XmlError::UnexpectedEof)?;
        self.index += 1;
        Ok(line)
    }

    fn line_number(&self) -> usize {
        self.index
    }

    fn expect(&mut self, literal: &str) -> Result<(), XmlError> {
        let line = self.next()?;
        if line == literal {
            Ok(())
        } else {
            Err(XmlError::Unexpected {
                line: self.line_number(),
                found: line.to_string(),
                expected: format!("`{literal}`"),
            })
        }
    }
}

/// Extracts `name="value"` attributes from one tag line.
fn attr(line: &str, name: &str, line_number: usize) -> Result<String, XmlError> {
    let needle = format!("{name}=\"");
    let start = line.find(&needle).ok_or(XmlError::MissingAttr {
        line: line_number,
        attr: match name {
            "name" => "name",
            "type" => "type",
            "model" => "model",
            _ => "port",
        },
    })?;
    let rest = &line[start + needle.len()..];
    let end = rest.find('"').ok_or(XmlError::Unexpected {
        line: line_number,
        found: line.to_string(),
        expected: "a closed attribute value".to_string(),
    })?;
    Ok(unescape(&rest[..end]))
}

/// Parses the canonical form back into a graph.
pub fn from_xml(text: &str) -> Result<ModelGraph, XmlError> {
    let mut lines = Lines::new(text);
    let header = lines.next()?;
    if !header.starts_with("<model ") {
        return Err(XmlError::Unexpected {
            line: lines.line_number(),
            found: header.to_string(),
            expected: "`<model ...>`".to_string(),
        });
    }
    let name = attr(header, "name", lines.line_number())?;
    let kind = attr(header, "type", lines.line_number())?;
    if kind != "coupled" {
        return Err(XmlError::Unexpected {
            line: lines.line_number(),
            found: kind,
            expected: "a coupled root model".to_string(),
        });
    }

    let mut graph = ModelGraph::new(&name);
    let root = graph.root();
    parse_body(&mut graph, root, true, &mut lines)?;

    if lines.peek().is_some() {
        return Err(XmlError::Unexpected {
            line: lines.line_number() + 1,
            found: lines.peek().unwrap_or("").to_string(),
            expected: "end of document".to_string(),
        });
    }
    Ok(graph)
}

fn parse_body(
    graph: &mut ModelGraph,
    id: ModelId,
    coupled: bool,
    lines: &mut Lines<'_>,
) -> Result<(), XmlError> {
    lines.expect("<in>")?;
    while lines.peek().map(|l| l.starts_with("<port ")).unwrap_or(false) {
        let line = lines.next()?;
        let port = attr(line, "name", lines.line_number())?;
        graph.add_input_port(id, &port)?;
    }
    lines.expect("</in>")?;

    lines.expect("<out>")?;
    while lines.peek().map(|l| l.starts_with("<port ")).unwrap_or(false) {
        let line = lines.next()?;
        let port = attr(line, "name", lines.line_number())?;
        graph.add_output_port(id, &port)?;
    }
    lines.expect("</out>")?;

    if coupled {
        lines.expect("<submodels>")?;
        while lines.peek().map(|l| l.starts_with("<model ")).unwrap_or(false) {
            let header = lines.next()?;
            let name = attr(header, "name", lines.line_number())?;
            let kind = attr(header, "type", lines.line_number())?;
            let (child, child_coupled) = match kind.as_str() {
                "atomic" => (graph.add_atomic(id, &name)?, false),
                "coupled" => (graph.add_coupled(id, &name)?, true),
                "opaque" => (graph.add_opaque(id, &name)?, false),
                other => {
                    return Err(XmlError::UnknownType {
                        line: lines.line_number(),
                        kind: other.to_string(),
                    })
                }
            };
            parse_body(graph, child, child_coupled, lines)?;
        }
        lines.expect("</submodels>")?;

        lines.expect("<connections>")?;
        while lines
            .peek()
            .map(|l| l.starts_with("<connection "))
            .unwrap_or(false)
        {
            parse_connection(graph, id, lines)?;
        }
        lines.expect("</connections>")?;
    }

    lines.expect("</model>")
}

fn parse_connection(
    graph: &mut ModelGraph,
    id: ModelId,
    lines: &mut Lines<'_>,
) -> Result<(), XmlError> {
    let header = lines.next()?;
    let kind = attr(header, "type", lines.line_number())?;

    let origin_line = lines.next()?;
    let origin_model = attr(origin_line, "model", lines.line_number())?;
    let origin_port = attr(origin_line, "port", lines.line_number())?;

    let destination_line = lines.next()?;
    let destination_model = attr(destination_line, "model", lines.line_number())?;
    let destination_port = attr(destination_line, "port", lines.line_number())?;

    lines.expect("</connection>")?;

    let resolve = |graph: &ModelGraph, name: &str| -> Result<ModelId, XmlError> {
        graph
            .find_child(id, name)
            .ok_or_else(|| XmlError::Graph(GraphError::UnknownModel(name.to_string())))
    };

    match kind.as_str() {
        "output" => {
            let child = resolve(graph, &origin_model)?;
            graph.add_output_connection(id, child, &origin_port, &destination_port)?;
        }
        "input" => {
            let child = resolve(graph, &destination_model)?;
            graph.add_input_connection(id, &origin_port, child, &destination_port)?;
        }
        "internal" => {
            let src = resolve(graph, &origin_model)?;
            let dst = resolve(graph, &destination_model)?;
            graph.add_internal_connection(id, src, &origin_port, dst, &destination_port)?;
        }
        other => {
            return Err(XmlError::Unexpected {
                line: lines.line_number(),
                found: other.to_string(),
                expected: "a connection type of output, input or internal".to_string(),
            })
        }
    }
    Ok(())
}
