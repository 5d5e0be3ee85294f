use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::model::{StructureKind, SubstrateStack};

/// Distance within which a port counts as touching a conductor.
pub const ADJACENCY_TOLERANCE_MM: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    pub fn centered(width: f64, length: f64) -> Self {
        Self {
            min_x: -width / 2.0,
            min_y: -length / 2.0,
            max_x: width / 2.0,
            max_y: length / 2.0,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

/// Closed conductor outline. Vertices run counter-clockwise and the last one connects back
/// to the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub vertices: Vec<Point>,
    #[serde(default)]
    pub net: Option<String>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>, net: Option<&str>) -> Self {
        Self {
            vertices,
            net: net.map(str::to_string),
        }
    }

    /// Axis-aligned rectangle, counter-clockwise from the lower left corner.
    pub fn rectangle(x0: f64, y0: f64, x1: f64, y1: f64, net: Option<&str>) -> Self {
        let (min_x, max_x) = (x0.min(x1), x0.max(x1));
        let (min_y, max_y) = (y0.min(y1), y0.max(y1));
        Self::new(
            vec![
                Point::new(min_x, min_y),
                Point::new(max_x, min_y),
                Point::new(max_x, max_y),
                Point::new(min_x, max_y),
            ],
            net,
        )
    }

    /// Shoelace area, positive for counter-clockwise outlines.
    pub fn signed_area(&self) -> f64 {
        let n = self.vertices.len();
        if n < 3 {
            return 0.0;
        }
        let twice: f64 = (0..n)
            .map(|i| {
                let a = self.vertices[i];
                let b = self.vertices[(i + 1) % n];
                a.x * b.y - b.x * a.y
            })
            .sum();
        twice / 2.0
    }

    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    pub fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    pub fn bounds(&self) -> Option<Rect> {
        let first = self.vertices.first()?;
        let init = Rect {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x,
            max_y: first.y,
        };
        Some(self.vertices.iter().fold(init, |r, p| Rect {
            min_x: r.min_x.min(p.x),
            min_y: r.min_y.min(p.y),
            max_x: r.max_x.max(p.x),
            max_y: r.max_y.max(p.y),
        }))
    }

    /// Even-odd ray cast.
    pub fn contains(&self, p: &Point) -> bool {
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    pub fn distance_to_boundary(&self, p: &Point) -> f64 {
        self.edges()
            .map(|(a, b)| segment_distance(p, &a, &b))
            .fold(f64::INFINITY, f64::min)
    }

    /// Inside, or within `tolerance` of the outline.
    pub fn touches(&self, p: &Point, tolerance: f64) -> bool {
        self.contains(p) || self.distance_to_boundary(p) <= tolerance
    }
}

fn segment_distance(p: &Point, a: &Point, b: &Point) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return p.distance(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
    p.distance(&Point::new(a.x + t * dx, a.y + t * dy))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Via {
    pub position: Point,
    pub diameter_mm: f64,
    pub drill_mm: f64,
    pub connected_layers: Vec<String>,
    #[serde(default)]
    pub net: Option<String>,
}

/// Direction a port launches its wave into the structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    #[serde(rename = "+x")]
    PlusX,
    #[serde(rename = "-x")]
    MinusX,
    #[serde(rename = "+y")]
    PlusY,
    #[serde(rename = "-y")]
    MinusY,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::PlusX => "+x",
            Orientation::MinusX => "-x",
            Orientation::PlusY => "+y",
            Orientation::MinusY => "-y",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "+x" => Some(Orientation::PlusX),
            "-x" => Some(Orientation::MinusX),
            "+y" => Some(Orientation::PlusY),
            "-y" => Some(Orientation::MinusY),
            _ => None,
        }
    }

    pub fn along_x(&self) -> bool {
        matches!(self, Orientation::PlusX | Orientation::MinusX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub number: u32,
    pub position: Point,
    pub layer: String,
    pub reference_layer: String,
    pub reference_impedance: f64,
    pub orientation: Orientation,
    /// Transverse extent of the feeding trace.
    pub width_mm: f64,
    pub excite: bool,
}

/// Layered conductor description of one design iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardModel {
    pub name: String,
    pub structure: StructureKind,
    pub stack: SubstrateStack,
    pub outline: Rect,
    pub layers: BTreeMap<String, Vec<Polygon>>,
    pub vias: Vec<Via>,
    pub ports: Vec<Port>,
    /// Design dimensions and targets carried along for downstream tools.
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
}

impl BoardModel {
    pub fn polygons(&self, layer: &str) -> &[Polygon] {
        self.layers.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn port(&self, number: u32) -> Option<&Port> {
        self.ports.iter().find(|p| p.number == number)
    }

    /// True when the port sits on or against a conductor of its own layer.
    pub fn port_has_conductor(&self, port: &Port) -> bool {
        self.polygons(&port.layer)
            .iter()
            .any(|poly| poly.touches(&port.position, ADJACENCY_TOLERANCE_MM))
    }

    pub fn polygon_count(&self) -> usize {
        self.layers.values().map(Vec::len).sum()
    }
}
