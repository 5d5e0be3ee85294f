//! `.kicad_pcb` subset: stack-up, per-layer copper zones, vias, nets and port annotations.
//!
//! Coordinates in the file follow the layout tool convention of `y` growing downwards, so
//! every `y` and every port orientation is mirrored on the way in and out. Numbers are written
//! with their shortest exact representation, which makes `parse_layout(write_layout(b)) == b`.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::board::check_board;
use crate::domain::board::{BoardModel, Orientation, Point, Polygon, Port, Rect, Via};
use crate::domain::model::{
    ConductorLayer, ConductorRole, DielectricLayer, StackLayer, StructureKind, SubstrateStack,
    DEFAULT_COPPER_CONDUCTIVITY,
};
use crate::utils::error::{Result, RfError};

const FORMAT_VERSION: u32 = 20221018;
const EDGE_LAYER: &str = "Edge.Cuts";
const EDGE_LAYER_ID: u32 = 44;
const EDGE_WIDTH_MM: f64 = 0.05;

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn num(v: f64) -> String {
    format!("{}", v)
}

fn flip(o: Orientation) -> Orientation {
    match o {
        Orientation::PlusY => Orientation::MinusY,
        Orientation::MinusY => Orientation::PlusY,
        other => other,
    }
}

fn line(out: &mut String, indent: usize, text: &str) {
    out.push_str(&"  ".repeat(indent));
    out.push_str(text);
    out.push('\n');
}

fn xy(p: &Point) -> String {
    format!("{} {}", num(p.x), num(-p.y))
}

/// Layer ids as the layout tool numbers copper: front 0, back 31, inner layers in between.
fn copper_ids(stack: &SubstrateStack) -> Vec<(u32, &ConductorLayer)> {
    let mut inner = 0;
    stack
        .conductors()
        .map(|c| {
            let id = match c.role {
                ConductorRole::Top => 0,
                ConductorRole::Bottom => 31,
                ConductorRole::Inner => {
                    inner += 1;
                    inner
                }
            };
            (id, c)
        })
        .collect()
}

fn role_name(role: ConductorRole) -> &'static str {
    match role {
        ConductorRole::Top => "top",
        ConductorRole::Inner => "inner",
        ConductorRole::Bottom => "bottom",
    }
}

/// Net names in a stable order, numbered from 1. Net 0 is the unconnected net.
fn net_table(board: &BoardModel) -> BTreeMap<String, u32> {
    let names: BTreeSet<&str> = board
        .layers
        .values()
        .flatten()
        .filter_map(|p| p.net.as_deref())
        .chain(board.vias.iter().filter_map(|v| v.net.as_deref()))
        .collect();
    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| (name.to_string(), i as u32 + 1))
        .collect()
}

pub fn write_layout(board: &BoardModel) -> String {
    let nets = net_table(board);
    let net_of = |net: &Option<String>| net.as_ref().and_then(|n| nets.get(n)).copied().unwrap_or(0);

    let mut out = String::new();
    line(
        &mut out,
        0,
        &format!("(kicad_pcb (version {}) (generator \"rfsynth\")", FORMAT_VERSION),
    );
    line(&mut out, 1, "(general");
    line(
        &mut out,
        2,
        &format!("(thickness {})", num(board.stack.total_thickness_mm())),
    );
    line(&mut out, 1, ")");

    line(&mut out, 1, "(layers");
    for (id, conductor) in copper_ids(&board.stack) {
        line(&mut out, 2, &format!("({} {} signal)", id, quote(&conductor.name)));
    }
    line(&mut out, 2, &format!("({} {} user)", EDGE_LAYER_ID, quote(EDGE_LAYER)));
    line(&mut out, 1, ")");

    line(&mut out, 1, "(setup");
    line(&mut out, 2, "(stackup");
    let mut dielectric_index = 0;
    for layer in &board.stack.layers {
        let text = match layer {
            StackLayer::Conductor(c) => format!(
                "(layer {} (type \"copper\") (thickness {}) (role {}) (conductivity {}))",
                quote(&c.name),
                num(c.thickness_mm),
                quote(role_name(c.role)),
                num(c.conductivity_s_per_m)
            ),
            StackLayer::Dielectric(d) => {
                dielectric_index += 1;
                format!(
                    "(layer \"dielectric {}\" (type \"core\") (thickness {}) (material {}) (epsilon_r {}) (loss_tangent {}))",
                    dielectric_index,
                    num(d.thickness_mm),
                    quote(&d.material),
                    num(d.permittivity),
                    num(d.loss_tangent)
                )
            }
        };
        line(&mut out, 3, &text);
    }
    line(&mut out, 2, ")");
    line(&mut out, 1, ")");

    line(
        &mut out,
        1,
        &format!(
            "(rfsynth_design (name {}) (structure {}))",
            quote(&board.name),
            quote(&board.structure.to_string())
        ),
    );
    line(&mut out, 1, "(rfsynth_attributes");
    for (key, value) in &board.attributes {
        line(&mut out, 2, &format!("(attribute {} {})", quote(key), num(*value)));
    }
    line(&mut out, 1, ")");

    line(&mut out, 1, "(net 0 \"\")");
    for (name, number) in &nets {
        line(&mut out, 1, &format!("(net {} {})", number, quote(name)));
    }

    let o = board.outline;
    line(
        &mut out,
        1,
        &format!(
            "(gr_rect (start {} {}) (end {} {}) (layer {}) (width {}))",
            num(o.min_x),
            num(-o.max_y),
            num(o.max_x),
            num(-o.min_y),
            quote(EDGE_LAYER),
            num(EDGE_WIDTH_MM)
        ),
    );

    for (layer, polygons) in &board.layers {
        for polygon in polygons {
            let net = net_of(&polygon.net);
            let net_name = polygon.net.clone().unwrap_or_default();
            line(
                &mut out,
                1,
                &format!(
                    "(zone (net {}) (net_name {}) (layer {})",
                    net,
                    quote(&net_name),
                    quote(layer)
                ),
            );
            line(&mut out, 2, "(polygon");
            line(&mut out, 3, "(pts");
            for vertex in &polygon.vertices {
                line(&mut out, 4, &format!("(xy {})", xy(vertex)));
            }
            line(&mut out, 3, ")");
            line(&mut out, 2, ")");
            line(&mut out, 1, ")");
        }
    }

    for via in &board.vias {
        let layers: Vec<String> = via.connected_layers.iter().map(|l| quote(l)).collect();
        line(
            &mut out,
            1,
            &format!(
                "(via (at {}) (size {}) (drill {}) (layers {}) (net {}))",
                xy(&via.position),
                num(via.diameter_mm),
                num(via.drill_mm),
                layers.join(" "),
                net_of(&via.net)
            ),
        );
    }

    for port in &board.ports {
        line(
            &mut out,
            1,
            &format!(
                "(rfsynth_port (number {}) (at {}) (layer {}) (reference_layer {}) (impedance {}) (orientation {}) (width {}) (excite {}))",
                port.number,
                xy(&port.position),
                quote(&port.layer),
                quote(&port.reference_layer),
                num(port.reference_impedance),
                quote(flip(port.orientation).as_str()),
                num(port.width_mm),
                if port.excite { "yes" } else { "no" }
            ),
        );
    }

    line(&mut out, 0, ")");
    out
}

fn parse_error(position: usize, message: impl Into<String>) -> RfError {
    RfError::LayoutParseError {
        position,
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Atom(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => text.push(escaped),
                            None => return Err(parse_error(tokens.len(), "unterminated escape")),
                        },
                        Some('"') => break,
                        Some(ch) => text.push(ch),
                        None => return Err(parse_error(tokens.len(), "unterminated string")),
                    }
                }
                tokens.push(Token::Atom(text));
            }
            _ => {
                let mut text = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || ch == '(' || ch == ')' || ch == '"' {
                        break;
                    }
                    text.push(ch);
                    chars.next();
                }
                tokens.push(Token::Atom(text));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Atom { text: String, pos: usize },
    List { items: Vec<Node>, pos: usize },
}

fn parse_node(tokens: &[Token], pos: &mut usize) -> Result<Node> {
    match tokens.get(*pos) {
        None => Err(parse_error(*pos, "unexpected end of input")),
        Some(Token::Close) => Err(parse_error(*pos, "unexpected ')'")),
        Some(Token::Atom(text)) => {
            let node = Node::Atom {
                text: text.clone(),
                pos: *pos,
            };
            *pos += 1;
            Ok(node)
        }
        Some(Token::Open) => {
            let start = *pos;
            *pos += 1;
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(Token::Close) => {
                        *pos += 1;
                        return Ok(Node::List { items, pos: start });
                    }
                    None => return Err(parse_error(start, "unclosed '('")),
                    Some(_) => items.push(parse_node(tokens, pos)?),
                }
            }
        }
    }
}

impl Node {
    fn pos(&self) -> usize {
        match self {
            Node::Atom { pos, .. } | Node::List { pos, .. } => *pos,
        }
    }

    fn items(&self) -> &[Node] {
        match self {
            Node::List { items, .. } => items,
            Node::Atom { .. } => &[],
        }
    }

    fn atom(&self) -> Option<&str> {
        match self {
            Node::Atom { text, .. } => Some(text),
            Node::List { .. } => None,
        }
    }

    fn head(&self) -> Option<&str> {
        self.items().first().and_then(Node::atom)
    }

    fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.items().iter().filter(move |n| n.head() == Some(name))
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.items().iter().find(|n| n.head() == Some(name))
    }

    fn require(&self, name: &str) -> Result<&Node> {
        self.child(name).ok_or_else(|| {
            parse_error(
                self.pos(),
                format!("({}) is missing '{}'", self.head().unwrap_or("?"), name),
            )
        })
    }

    fn arg(&self, index: usize) -> Result<&str> {
        self.items()
            .get(index)
            .and_then(Node::atom)
            .ok_or_else(|| {
                parse_error(
                    self.pos(),
                    format!("({}) needs an atom at position {}", self.head().unwrap_or("?"), index),
                )
            })
    }

    fn number<T: std::str::FromStr>(&self, index: usize) -> Result<T> {
        let text = self.arg(index)?;
        text.parse().map_err(|_| {
            parse_error(
                self.pos(),
                format!("'{}' in ({}) is not a number", text, self.head().unwrap_or("?")),
            )
        })
    }

    fn value_str(&self, name: &str) -> Result<&str> {
        self.require(name)?.arg(1)
    }

    fn value_f64(&self, name: &str) -> Result<f64> {
        self.require(name)?.number(1)
    }

    fn point(&self, name: &str) -> Result<Point> {
        let node = self.require(name)?;
        Ok(Point::new(node.number(1)?, -node.number::<f64>(2)?))
    }
}

fn parse_stack(root: &Node) -> Result<SubstrateStack> {
    let stackup = root.require("setup")?.require("stackup")?;
    let mut layers = Vec::new();
    for layer in stackup.children("layer") {
        let name = layer.arg(1)?;
        let thickness_mm = layer.value_f64("thickness")?;
        if layer.value_str("type")? == "copper" {
            let role = match layer.value_str("role")? {
                "top" => ConductorRole::Top,
                "inner" => ConductorRole::Inner,
                "bottom" => ConductorRole::Bottom,
                other => {
                    return Err(parse_error(layer.pos(), format!("unknown conductor role '{}'", other)))
                }
            };
            let conductivity_s_per_m = match layer.child("conductivity") {
                Some(node) => node.number(1)?,
                None => DEFAULT_COPPER_CONDUCTIVITY,
            };
            layers.push(StackLayer::Conductor(ConductorLayer {
                name: name.to_string(),
                role,
                thickness_mm,
                conductivity_s_per_m,
            }));
        } else {
            let loss_tangent = match layer.child("loss_tangent") {
                Some(node) => node.number(1)?,
                None => 0.0,
            };
            layers.push(StackLayer::Dielectric(DielectricLayer {
                material: layer.value_str("material").unwrap_or(name).to_string(),
                thickness_mm,
                permittivity: layer.value_f64("epsilon_r")?,
                loss_tangent,
            }));
        }
    }
    Ok(SubstrateStack { layers })
}

fn parse_outline(root: &Node) -> Result<Rect> {
    let rect = root
        .children("gr_rect")
        .find(|n| n.value_str("layer").ok() == Some(EDGE_LAYER))
        .ok_or_else(|| parse_error(root.pos(), "no board outline on Edge.Cuts"))?;
    let start = rect.point("start")?;
    let end = rect.point("end")?;
    Ok(Rect {
        min_x: start.x.min(end.x),
        min_y: start.y.min(end.y),
        max_x: start.x.max(end.x),
        max_y: start.y.max(end.y),
    })
}

fn parse_net(node: &Node, nets: &BTreeMap<u32, String>) -> Result<Option<String>> {
    let Some(net) = node.child("net") else {
        return Ok(None);
    };
    let number: u32 = net.number(1)?;
    if number == 0 {
        return Ok(None);
    }
    nets.get(&number)
        .cloned()
        .map(Some)
        .ok_or_else(|| parse_error(net.pos(), format!("undeclared net {}", number)))
}

fn parse_polygon(node: &Node, nets: &BTreeMap<u32, String>) -> Result<(String, Polygon)> {
    let layer = node.value_str("layer")?.to_string();
    let pts = match node.child("polygon") {
        Some(polygon) => polygon.require("pts")?,
        None => node.require("pts")?,
    };
    let vertices = pts
        .children("xy")
        .map(|p| Ok(Point::new(p.number(1)?, -p.number::<f64>(2)?)))
        .collect::<Result<Vec<_>>>()?;
    let net = parse_net(node, nets)?;
    Ok((layer, Polygon { vertices, net }))
}

fn parse_via(node: &Node, nets: &BTreeMap<u32, String>) -> Result<Via> {
    let layers = node.require("layers")?;
    let connected_layers = (1..layers.items().len())
        .map(|i| layers.arg(i).map(str::to_string))
        .collect::<Result<Vec<_>>>()?;
    Ok(Via {
        position: node.point("at")?,
        diameter_mm: node.value_f64("size")?,
        drill_mm: node.value_f64("drill")?,
        connected_layers,
        net: parse_net(node, nets)?,
    })
}

fn parse_port(node: &Node) -> Result<Port> {
    let orientation = node.value_str("orientation")?;
    let orientation = Orientation::parse(orientation).ok_or_else(|| {
        parse_error(node.pos(), format!("unknown port orientation '{}'", orientation))
    })?;
    Ok(Port {
        number: node.require("number")?.number(1)?,
        position: node.point("at")?,
        layer: node.value_str("layer")?.to_string(),
        reference_layer: node.value_str("reference_layer")?.to_string(),
        reference_impedance: node.value_f64("impedance")?,
        orientation: flip(orientation),
        width_mm: node.value_f64("width")?,
        excite: node.value_str("excite")? == "yes",
    })
}

/// Reads a layout written by [`write_layout`] and checks it like a freshly built board.
pub fn parse_layout(input: &str) -> Result<BoardModel> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let root = parse_node(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(parse_error(pos, "trailing content after the board"));
    }
    if root.head() != Some("kicad_pcb") {
        return Err(parse_error(0, "not a kicad_pcb file"));
    }

    let stack = parse_stack(&root)?;
    let design = root.require("rfsynth_design")?;
    let structure_name = design.value_str("structure")?;
    let structure: StructureKind = structure_name.parse().map_err(|_| {
        parse_error(design.pos(), format!("unknown structure '{}'", structure_name))
    })?;

    let mut attributes = BTreeMap::new();
    if let Some(node) = root.child("rfsynth_attributes") {
        for attribute in node.children("attribute") {
            attributes.insert(attribute.arg(1)?.to_string(), attribute.number(2)?);
        }
    }

    let mut nets = BTreeMap::new();
    for net in root.children("net") {
        nets.insert(net.number::<u32>(1)?, net.arg(2)?.to_string());
    }

    let mut layers: BTreeMap<String, Vec<Polygon>> = BTreeMap::new();
    for node in root.children("zone").chain(root.children("gr_poly")) {
        let (layer, polygon) = parse_polygon(node, &nets)?;
        layers.entry(layer).or_default().push(polygon);
    }

    let board = BoardModel {
        name: design.value_str("name")?.to_string(),
        structure,
        stack,
        outline: parse_outline(&root)?,
        layers,
        vias: root
            .children("via")
            .map(|n| parse_via(n, &nets))
            .collect::<Result<Vec<_>>>()?,
        ports: root
            .children("rfsynth_port")
            .map(parse_port)
            .collect::<Result<Vec<_>>>()?,
        attributes,
    };

    board.stack.validate()?;
    check_board(&board)?;
    tracing::debug!(
        "Parsed layout '{}' with {} polygons and {} ports",
        board.name,
        board.polygon_count(),
        board.ports.len()
    );
    Ok(board)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::board::BoardModelBuilder;
    use crate::core::synthesis::{GeometrySynthesizer, SynthesisConfig};
    use crate::domain::model::ElectricalTarget;

    fn board(kind: StructureKind) -> BoardModel {
        let stack = SubstrateStack::two_layer(4.3, 1.6, 35.0, 0.02);
        let geometry = GeometrySynthesizer::new(kind, SynthesisConfig::default())
            .synthesize(&ElectricalTarget::new(50.0, 2.45e9), &stack)
            .unwrap();
        BoardModelBuilder::new(50.0)
            .with_name(format!("{}_test", kind))
            .build(&geometry, &stack)
            .unwrap()
    }

    #[test]
    fn test_layout_round_trips_every_structure() {
        for kind in [StructureKind::Microstrip, StructureKind::Patch, StructureKind::Gcpw] {
            let original = board(kind);
            let text = write_layout(&original);
            let parsed = parse_layout(&text).unwrap();
            assert_eq!(parsed, original, "{} layout changed on round trip", kind);
        }
    }

    #[test]
    fn test_layout_mirrors_y_for_layout_tools() {
        let board = board(StructureKind::Microstrip);
        let text = write_layout(&board);
        let o = board.outline;
        assert!(text.contains(&format!("(start {} {})", num(o.min_x), num(-o.max_y))));
        assert!(text.contains("(net 1 \"GND\")"));
        assert!(text.contains("(net 2 \"RF\")"));
    }

    #[test]
    fn test_unclosed_list_reports_position() {
        let err = parse_layout("(kicad_pcb (version 1)").unwrap_err();
        assert!(matches!(err, RfError::LayoutParseError { position: 0, .. }));
    }

    #[test]
    fn test_missing_stackup_is_parse_error() {
        let err = parse_layout("(kicad_pcb (version 1) (setup))").unwrap_err();
        assert!(matches!(err, RfError::LayoutParseError { .. }));
    }

    #[test]
    fn test_zone_on_unknown_layer_is_rejected() {
        let text = write_layout(&board(StructureKind::Microstrip))
            .replacen("(layer \"B.Cu\")\n", "(layer \"In7.Cu\")\n", 1);
        let err = parse_layout(&text).unwrap_err();
        assert!(matches!(err, RfError::UnresolvedLayerReference { ref layer, .. } if layer == "In7.Cu"));
    }

    #[test]
    fn test_quoted_names_survive_escaping() {
        let mut board = board(StructureKind::Microstrip);
        board.name = "say \"hi\" \\ bye".to_string();
        let parsed = parse_layout(&write_layout(&board)).unwrap();
        assert_eq!(parsed.name, board.name);
    }
}
