use std::collections::BTreeMap;

use crate::domain::board::{BoardModel, Orientation, Point, Polygon, Port, Rect, Via};
use crate::domain::model::{Dimension, Geometry, StructureKind, SubstrateStack};
use crate::utils::error::{Result, RfError};

pub const SIGNAL_NET: &str = "RF";
pub const GROUND_NET: &str = "GND";

/// Lays out a synthesized geometry on the stack-up.
///
/// The structure is centred on the origin with its feed entering from `-y`. Output depends
/// only on the inputs, so rebuilding from the same geometry gives an identical board.
#[derive(Debug, Clone)]
pub struct BoardModelBuilder {
    name: Option<String>,
    reference_impedance: f64,
}

impl BoardModelBuilder {
    pub fn new(reference_impedance: f64) -> Self {
        Self {
            name: None,
            reference_impedance,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn build(&self, geometry: &Geometry, stack: &SubstrateStack) -> Result<BoardModel> {
        let required_by = format!("{} geometry", geometry.structure);
        for layer in [&geometry.signal_layer, &geometry.reference_layer] {
            if stack.conductor(layer).is_none() {
                return Err(RfError::UnresolvedLayerReference {
                    layer: layer.clone(),
                    required_by,
                });
            }
        }

        let mut board = match geometry.structure {
            StructureKind::Microstrip => self.microstrip(geometry, stack)?,
            StructureKind::Patch => self.patch(geometry, stack)?,
            StructureKind::Gcpw => self.gcpw(geometry, stack)?,
        };
        board.attributes = self.attributes(geometry, stack)?;

        if let Err(e) = check_board(&board) {
            tracing::error!("❌ Board model rejected: {}. State: {:?}", e, board);
            return Err(e);
        }

        tracing::debug!(
            "Board '{}' built with {} polygons, {} vias, {} ports",
            board.name,
            board.polygon_count(),
            board.vias.len(),
            board.ports.len()
        );
        Ok(board)
    }

    fn empty_board(&self, geometry: &Geometry, stack: &SubstrateStack, outline: Rect) -> BoardModel {
        BoardModel {
            name: self
                .name
                .clone()
                .unwrap_or_else(|| geometry.structure.to_string()),
            structure: geometry.structure,
            stack: stack.clone(),
            outline,
            layers: BTreeMap::new(),
            vias: Vec::new(),
            ports: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    fn port(&self, geometry: &Geometry, number: u32, position: Point, width: f64) -> Port {
        let orientation = if position.y < 0.0 {
            Orientation::PlusY
        } else {
            Orientation::MinusY
        };
        Port {
            number,
            position,
            layer: geometry.signal_layer.clone(),
            reference_layer: geometry.reference_layer.clone(),
            reference_impedance: self.reference_impedance,
            orientation,
            width_mm: width,
            excite: number == 1,
        }
    }

    fn add(board: &mut BoardModel, layer: &str, polygon: Polygon) {
        board.layers.entry(layer.to_string()).or_default().push(polygon);
    }

    fn ground_plane(board: &mut BoardModel, geometry: &Geometry) {
        let o = board.outline;
        Self::add(
            board,
            &geometry.reference_layer,
            Polygon::rectangle(o.min_x, o.min_y, o.max_x, o.max_y, Some(GROUND_NET)),
        );
    }

    fn two_port_line(&self, geometry: &Geometry, board: &mut BoardModel, width: f64, length: f64) {
        Self::add(
            board,
            &geometry.signal_layer,
            Polygon::rectangle(-width / 2.0, -length / 2.0, width / 2.0, length / 2.0, Some(SIGNAL_NET)),
        );
        board.ports = vec![
            self.port(geometry, 1, Point::new(0.0, -length / 2.0), width),
            self.port(geometry, 2, Point::new(0.0, length / 2.0), width),
        ];
    }

    fn microstrip(&self, geometry: &Geometry, stack: &SubstrateStack) -> Result<BoardModel> {
        let width = geometry.require(Dimension::TraceWidth)?;
        let length = geometry.require(Dimension::TraceLength)?;
        let outline = Rect::centered(geometry.require(Dimension::GroundPlaneWidth)?, length);

        let mut board = self.empty_board(geometry, stack, outline);
        self.two_port_line(geometry, &mut board, width, length);
        Self::ground_plane(&mut board, geometry);
        Ok(board)
    }

    fn patch(&self, geometry: &Geometry, stack: &SubstrateStack) -> Result<BoardModel> {
        let w = geometry.require(Dimension::PatchWidth)?;
        let l = geometry.require(Dimension::PatchLength)?;
        let feed_w = geometry.require(Dimension::FeedWidth)?;
        let inset = geometry.require(Dimension::FeedInsetLength)?;
        let notch = geometry.require(Dimension::NotchGap)?;
        let outline = Rect::centered(
            geometry.require(Dimension::GroundPlaneWidth)?,
            geometry.require(Dimension::GroundPlaneLength)?,
        );

        let mut board = self.empty_board(geometry, stack, outline);

        let bottom = -l / 2.0;
        let slot = feed_w / 2.0 + notch;
        let patch = Polygon::new(
            vec![
                Point::new(-w / 2.0, bottom),
                Point::new(-slot, bottom),
                Point::new(-slot, bottom + inset),
                Point::new(slot, bottom + inset),
                Point::new(slot, bottom),
                Point::new(w / 2.0, bottom),
                Point::new(w / 2.0, l / 2.0),
                Point::new(-w / 2.0, l / 2.0),
            ],
            Some(SIGNAL_NET),
        );
        Self::add(&mut board, &geometry.signal_layer, patch);
        Self::add(
            &mut board,
            &geometry.signal_layer,
            Polygon::rectangle(
                -feed_w / 2.0,
                outline.min_y,
                feed_w / 2.0,
                bottom + inset,
                Some(SIGNAL_NET),
            ),
        );
        Self::ground_plane(&mut board, geometry);
        board.ports = vec![self.port(geometry, 1, Point::new(0.0, outline.min_y), feed_w)];
        Ok(board)
    }

    fn gcpw(&self, geometry: &Geometry, stack: &SubstrateStack) -> Result<BoardModel> {
        let width = geometry.require(Dimension::TraceWidth)?;
        let length = geometry.require(Dimension::TraceLength)?;
        let gap = geometry.require(Dimension::GapWidth)?;
        let pitch = geometry.require(Dimension::ViaPitch)?;
        let offset = geometry.require(Dimension::ViaOffset)?;
        let diameter = geometry.require(Dimension::ViaDiameter)?;
        let drill = geometry.require(Dimension::ViaDrill)?;
        let outline = Rect::centered(geometry.require(Dimension::GroundPlaneWidth)?, length);

        let mut board = self.empty_board(geometry, stack, outline);
        self.two_port_line(geometry, &mut board, width, length);

        let inner = width / 2.0 + gap;
        for (x0, x1) in [(outline.min_x, -inner), (inner, outline.max_x)] {
            Self::add(
                &mut board,
                &geometry.signal_layer,
                Polygon::rectangle(x0, outline.min_y, x1, outline.max_y, Some(GROUND_NET)),
            );
        }
        Self::ground_plane(&mut board, geometry);

        // Evenly spread so the actual spacing never exceeds the synthesized pitch.
        let count = (length / pitch).ceil().max(1.0) as usize;
        let spacing = length / count as f64;
        let connected = vec![geometry.signal_layer.clone(), geometry.reference_layer.clone()];
        for x in [-offset, offset] {
            for i in 0..count {
                board.vias.push(Via {
                    position: Point::new(x, outline.min_y + (i as f64 + 0.5) * spacing),
                    diameter_mm: diameter,
                    drill_mm: drill,
                    connected_layers: connected.clone(),
                    net: Some(GROUND_NET.to_string()),
                });
            }
        }
        Ok(board)
    }

    fn attributes(&self, geometry: &Geometry, stack: &SubstrateStack) -> Result<BTreeMap<String, f64>> {
        let view = stack.substrate_under_top()?;
        let mut attributes: BTreeMap<String, f64> = geometry
            .dimensions
            .iter()
            .map(|(d, v)| (format!("{}_mm", d.name()), *v))
            .collect();
        attributes.insert("target_impedance_ohms".to_string(), geometry.target.impedance_ohms);
        attributes.insert("target_frequency_hz".to_string(), geometry.target.frequency_hz);
        attributes.insert("reference_impedance_ohms".to_string(), self.reference_impedance);
        attributes.insert("substrate_height_mm".to_string(), view.height_mm);
        attributes.insert("substrate_permittivity".to_string(), view.permittivity);
        attributes.insert("substrate_loss_tangent".to_string(), view.loss_tangent);
        attributes.insert("copper_thickness_mm".to_string(), view.copper_thickness_mm);
        Ok(attributes)
    }
}

/// Structural checks shared by the builder and the layout importer.
pub fn check_board(board: &BoardModel) -> Result<()> {
    for (layer, polygons) in &board.layers {
        if board.stack.conductor(layer).is_none() {
            return Err(RfError::UnresolvedLayerReference {
                layer: layer.clone(),
                required_by: "board polygons".to_string(),
            });
        }
        if let Some(i) = polygons.iter().position(|p| p.area() <= 0.0) {
            return Err(RfError::DegenerateGeometry {
                reason: format!("polygon {} on layer '{}' has zero area", i, layer),
            });
        }
    }
    for port in &board.ports {
        for layer in [&port.layer, &port.reference_layer] {
            if board.stack.conductor(layer).is_none() {
                return Err(RfError::UnresolvedLayerReference {
                    layer: layer.clone(),
                    required_by: format!("port {}", port.number),
                });
            }
        }
        if !board.port_has_conductor(port) {
            return Err(RfError::DegenerateGeometry {
                reason: format!(
                    "port {} at ({:.3}, {:.3}) has no adjacent conductor on '{}'",
                    port.number, port.position.x, port.position.y, port.layer
                ),
            });
        }
    }
    Ok(())
}
