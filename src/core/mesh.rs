use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

use crate::core::equations::SPEED_OF_LIGHT;
use crate::domain::board::{BoardModel, Polygon};
use crate::domain::model::{ConductorRole, StackLayer};
use crate::domain::simulation::{
    Axis, BoundaryCondition, Boundaries, ExcitationPort, FrequencyRange, Material, MaterialRegion,
    MeshLines, PortKind, RegionShape, SimulationDomain, Waveform,
};
use crate::utils::error::{Result, RfError};

const VACUUM_PERMITTIVITY: f64 = 8.854_187_812_8e-12;
/// Coordinates closer than this are treated as the same position, in millimetres.
const COINCIDENT_MM: f64 = 1e-9;
const MAX_GRADING_PASSES: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Largest cell near conductors, as a fraction of the shortest wavelength in the densest
    /// dielectric.
    pub metal_resolution: f64,
    /// Largest cell in the surrounding air, as a fraction of the shortest free-space wavelength.
    pub air_resolution: f64,
    /// Thirds-rule offset as a fraction of the smallest conductor feature.
    pub edge_offset_fraction: f64,
    pub min_spacing_mm: f64,
    /// Largest allowed ratio between neighbouring cells.
    pub grading_ratio: f64,
    /// Lines through every dielectric layer, interfaces included.
    pub min_lines_per_dielectric: usize,
    /// Air around the board, in free-space wavelengths at the band centre.
    pub air_padding_wavelengths: f64,
    pub pml_cells: u8,
    pub port_kind: PortKind,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            metal_resolution: 1.0 / 20.0,
            air_resolution: 1.0 / 10.0,
            edge_offset_fraction: 0.25,
            min_spacing_mm: 0.01,
            grading_ratio: 1.5,
            min_lines_per_dielectric: 5,
            air_padding_wavelengths: 0.25,
            pml_cells: 8,
            port_kind: PortKind::Lumped,
        }
    }
}

/// A straight conductor boundary perpendicular to one axis.
#[derive(Debug, Clone, Copy)]
struct Edge {
    coord: f64,
    /// +1 when metal lies on the positive side, -1 on the negative side, 0 if unknown.
    metal_side: f64,
}

#[derive(Debug, Clone, Copy)]
struct Line {
    coord: f64,
    /// Interface and domain lines that merging must never move.
    pinned: bool,
}

impl Line {
    fn free(coord: f64) -> Self {
        Self { coord, pinned: false }
    }

    fn pinned(coord: f64) -> Self {
        Self { coord, pinned: true }
    }
}

/// Discretizes a board model into a solver-ready domain.
#[derive(Debug, Clone, Default)]
pub struct MeshConverter {
    config: MeshConfig,
}

impl MeshConverter {
    pub fn new(config: MeshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn convert(&self, board: &BoardModel, range: &FrequencyRange) -> Result<SimulationDomain> {
        range.validate()?;
        let regions = self.material_regions(board, range)?;
        if let Err(e) = check_ports(board, &regions) {
            tracing::error!(
                "❌ Cannot discretize '{}': {}. Layers: {:?}, ports: {:?}",
                board.name,
                e,
                board.layers.keys().collect::<Vec<_>>(),
                board.ports
            );
            return Err(e);
        }

        let boundaries = self.boundaries(board);
        let mesh = self.mesh_lines(board, range, &boundaries)?;
        let ports = self.excitation_ports(board)?;

        let mut attributes = board.attributes.clone();
        attributes.insert("mesh_cells".to_string(), mesh.cell_count() as f64);
        attributes.insert("max_cell_mm".to_string(), self.metal_cell(board, range));
        attributes.insert("edge_offset_mm".to_string(), self.edge_offset(board, range));

        tracing::info!(
            "🧮 Mesh for '{}': {} x {} x {} lines ({} cells)",
            board.name,
            mesh.x.len(),
            mesh.y.len(),
            mesh.z.len(),
            mesh.cell_count()
        );

        Ok(SimulationDomain {
            name: board.name.clone(),
            structure: board.structure,
            unit_m: 1e-3,
            mesh,
            regions,
            boundaries,
            ports,
            waveform: Waveform::Gaussian {
                f0_hz: range.center_hz(),
                fc_hz: range.half_span_hz(),
            },
            frequency_range: *range,
            attributes,
        })
    }

    fn metal_cell(&self, board: &BoardModel, range: &FrequencyRange) -> f64 {
        let lambda = SPEED_OF_LIGHT / (range.stop_hz * board.stack.max_permittivity().sqrt()) * 1e3;
        lambda * self.config.metal_resolution
    }

    fn air_cell(&self, range: &FrequencyRange) -> f64 {
        SPEED_OF_LIGHT / range.stop_hz * 1e3 * self.config.air_resolution
    }

    fn smallest_feature(board: &BoardModel) -> f64 {
        let polygon_features = board
            .layers
            .values()
            .flatten()
            .filter_map(Polygon::bounds)
            .flat_map(|b| [b.width(), b.height()]);
        let gaps = ["gap_width_mm", "notch_gap_mm"]
            .into_iter()
            .filter_map(|key| board.attributes.get(key).copied());
        let vias = board.vias.iter().map(|v| v.diameter_mm);
        polygon_features
            .chain(gaps)
            .chain(vias)
            .filter(|v| *v > 0.0)
            .fold(f64::INFINITY, f64::min)
    }

    fn edge_offset(&self, board: &BoardModel, range: &FrequencyRange) -> f64 {
        let feature = Self::smallest_feature(board);
        let offset = if feature.is_finite() {
            feature * self.config.edge_offset_fraction
        } else {
            self.metal_cell(board, range)
        };
        offset
            .min(self.metal_cell(board, range))
            .max(3.0 * self.config.min_spacing_mm)
    }

    /// Bottom copper covering the whole outline acts as an electric wall.
    fn has_full_bottom_ground(board: &BoardModel) -> bool {
        let Some(bottom) = board.stack.conductor_with_role(ConductorRole::Bottom) else {
            return false;
        };
        let o = board.outline;
        board.polygons(&bottom.name).iter().any(|p| {
            p.bounds().is_some_and(|b| {
                b.min_x <= o.min_x + COINCIDENT_MM
                    && b.min_y <= o.min_y + COINCIDENT_MM
                    && b.max_x >= o.max_x - COINCIDENT_MM
                    && b.max_y >= o.max_y - COINCIDENT_MM
            }) && (p.area() - o.width() * o.height()).abs() <= 1e-6 * p.area()
        })
    }

    fn boundaries(&self, board: &BoardModel) -> Boundaries {
        let mut boundaries = Boundaries::uniform(BoundaryCondition::Pml {
            cells: self.config.pml_cells,
        });
        if !board.structure.is_radiator() && Self::has_full_bottom_ground(board) {
            boundaries.z_min = BoundaryCondition::Pec;
        }
        boundaries
    }

    fn material_regions(
        &self,
        board: &BoardModel,
        range: &FrequencyRange,
    ) -> Result<Vec<MaterialRegion>> {
        let o = board.outline;
        let omega = 2.0 * PI * range.center_hz();
        let extents = board.stack.extents();
        let mut regions = Vec::new();

        for (layer, extent) in board.stack.layers.iter().zip(&extents) {
            match layer {
                StackLayer::Dielectric(d) => regions.push(MaterialRegion {
                    name: format!("{}_{}", d.material, extent.index),
                    layer: None,
                    material: Material::Dielectric {
                        name: d.material.clone(),
                        permittivity: d.permittivity,
                        loss_tangent: d.loss_tangent,
                        conductivity_s_per_m: omega
                            * VACUUM_PERMITTIVITY
                            * d.permittivity
                            * d.loss_tangent,
                    },
                    shape: RegionShape::Box {
                        min: [o.min_x, o.min_y, extent.z_bottom],
                        max: [o.max_x, o.max_y, extent.z_top],
                    },
                    priority: 10,
                }),
                StackLayer::Conductor(c) => {
                    for (i, polygon) in board.polygons(&c.name).iter().enumerate() {
                        if polygon.area() <= 0.0 {
                            return Err(RfError::DegenerateGeometry {
                                reason: format!(
                                    "polygon {} on layer '{}' has zero area",
                                    i, c.name
                                ),
                            });
                        }
                        regions.push(MaterialRegion {
                            name: format!("{}_{}", c.name, i),
                            layer: Some(c.name.clone()),
                            material: Material::Conductor {
                                name: "copper".to_string(),
                                conductivity_s_per_m: c.conductivity_s_per_m,
                            },
                            shape: RegionShape::ExtrudedPolygon {
                                vertices: polygon.vertices.clone(),
                                z_min: extent.z_bottom,
                                z_max: extent.z_top,
                            },
                            priority: 100,
                        });
                    }
                }
            }
        }

        // Layers named on the board but missing from the stack never reach the grid.
        for (layer, polygons) in &board.layers {
            if board.stack.conductor(layer).is_none() && !polygons.is_empty() {
                tracing::warn!(
                    "⚠️ Layer '{}' is not part of the stack-up; its {} polygons are ignored",
                    layer,
                    polygons.len()
                );
            }
        }

        for (i, via) in board.vias.iter().enumerate() {
            let spans: Vec<_> = via
                .connected_layers
                .iter()
                .filter_map(|name| board.stack.conductor_extent(name))
                .collect();
            if spans.len() < 2 {
                return Err(RfError::DegenerateGeometry {
                    reason: format!("via {} does not connect two stack conductors", i),
                });
            }
            let z_min = spans.iter().map(|e| e.z_bottom).fold(f64::INFINITY, f64::min);
            let z_max = spans.iter().map(|e| e.z_top).fold(f64::NEG_INFINITY, f64::max);
            regions.push(MaterialRegion {
                name: format!("via_{}", i),
                layer: via.connected_layers.first().cloned(),
                material: Material::Conductor {
                    name: "copper".to_string(),
                    conductivity_s_per_m: crate::domain::model::DEFAULT_COPPER_CONDUCTIVITY,
                },
                shape: RegionShape::Cylinder {
                    center: via.position,
                    radius: via.diameter_mm / 2.0,
                    z_min,
                    z_max,
                },
                priority: 100,
            });
        }

        Ok(regions)
    }

    fn excitation_ports(&self, board: &BoardModel) -> Result<Vec<ExcitationPort>> {
        board
            .ports
            .iter()
            .map(|port| {
                let signal = board.stack.conductor_extent(&port.layer);
                let reference = board.stack.conductor_extent(&port.reference_layer);
                let (Some(signal), Some(reference)) = (signal, reference) else {
                    return Err(RfError::DegenerateGeometry {
                        reason: format!("port {} references a layer outside the grid", port.number),
                    });
                };
                let (z_start, z_stop) = if reference.z_top <= signal.z_bottom {
                    (reference.z_top, signal.z_bottom)
                } else {
                    (reference.z_bottom, signal.z_top)
                };
                let half = port.width_mm / 2.0;
                let p = port.position;
                let (start, stop) = if port.orientation.along_x() {
                    ([p.x, p.y - half, z_start], [p.x, p.y + half, z_stop])
                } else {
                    ([p.x - half, p.y, z_start], [p.x + half, p.y, z_stop])
                };
                Ok(ExcitationPort {
                    number: port.number,
                    kind: self.config.port_kind,
                    layer: port.layer.clone(),
                    reference_layer: port.reference_layer.clone(),
                    reference_impedance: port.reference_impedance,
                    direction: port.orientation,
                    start,
                    stop,
                    excite: port.excite,
                })
            })
            .collect()
    }

    fn mesh_lines(
        &self,
        board: &BoardModel,
        range: &FrequencyRange,
        boundaries: &Boundaries,
    ) -> Result<MeshLines> {
        let metal_cell = self.metal_cell(board, range);
        let air_cell = self.air_cell(range);
        let offset = self.edge_offset(board, range);
        let pad = self.config.air_padding_wavelengths * SPEED_OF_LIGHT / range.center_hz() * 1e3;
        let o = board.outline;
        let (x_edges, y_edges) = conductor_edges(board);

        let x = self.plane_axis(
            &x_edges,
            (o.min_x, o.max_x),
            (o.min_x - pad, o.max_x + pad),
            (boundaries.x_min, boundaries.x_max),
            offset,
            metal_cell,
            air_cell,
        );
        let y = self.plane_axis(
            &y_edges,
            (o.min_y, o.max_y),
            (o.min_y - pad, o.max_y + pad),
            (boundaries.y_min, boundaries.y_max),
            offset,
            metal_cell,
            air_cell,
        );

        let top = board.stack.total_thickness_mm();
        let z_lo = if boundaries.z_min == BoundaryCondition::Pec {
            0.0
        } else {
            -pad
        };
        let mut z_lines = vec![Line::pinned(z_lo), Line::pinned(top + pad)];
        for (layer, extent) in board.stack.layers.iter().zip(board.stack.extents()) {
            z_lines.push(Line::pinned(extent.z_bottom));
            z_lines.push(Line::pinned(extent.z_top));
            if let StackLayer::Dielectric(_) = layer {
                let cells = self.config.min_lines_per_dielectric.saturating_sub(1).max(1);
                let step = (extent.z_top - extent.z_bottom) / cells as f64;
                z_lines.extend((1..cells).map(|i| Line::free(extent.z_bottom + step * i as f64)));
            }
        }
        z_lines.extend(pml_lines(
            (z_lo, top + pad),
            (boundaries.z_min, boundaries.z_max),
            air_cell,
        ));
        let z = self.fill(
            merge_lines(z_lines, self.config.min_spacing_mm),
            |z| {
                if (0.0..=top).contains(&z) {
                    metal_cell
                } else {
                    air_cell
                }
            },
        );

        let mesh = MeshLines { x, y, z };
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            if mesh.axis(axis).windows(2).any(|w| w[1] - w[0] <= 0.0) {
                return Err(RfError::DegenerateGeometry {
                    reason: format!("mesh lines on {:?} are not strictly increasing", axis),
                });
            }
        }
        Ok(mesh)
    }

    #[allow(clippy::too_many_arguments)]
    fn plane_axis(
        &self,
        edges: &[Edge],
        board_span: (f64, f64),
        domain: (f64, f64),
        faces: (BoundaryCondition, BoundaryCondition),
        offset: f64,
        metal_cell: f64,
        air_cell: f64,
    ) -> Vec<f64> {
        let mut lines = vec![Line::pinned(domain.0), Line::pinned(domain.1)];
        for edge in edges {
            let candidates = if edge.metal_side == 0.0 {
                [edge.coord - offset / 2.0, edge.coord + offset / 2.0]
            } else {
                [
                    edge.coord + edge.metal_side * offset / 3.0,
                    edge.coord - edge.metal_side * 2.0 * offset / 3.0,
                ]
            };
            lines.extend(
                candidates
                    .into_iter()
                    .filter(|c| *c > domain.0 && *c < domain.1)
                    .map(Line::free),
            );
        }
        lines.extend(pml_lines(domain, faces, air_cell));

        let merged: Vec<f64> = merge_lines(lines, self.config.min_spacing_mm)
            .into_iter()
            .filter(|c| edges.iter().all(|e| (e.coord - c).abs() > COINCIDENT_MM))
            .collect();
        let filled = self.fill(merged, |c| {
            if c >= board_span.0 && c <= board_span.1 {
                metal_cell
            } else {
                air_cell
            }
        });
        // Fill lines are midpoints, so they could still land on an edge.
        filled
            .into_iter()
            .filter(|c| edges.iter().all(|e| (e.coord - c).abs() > COINCIDENT_MM))
            .collect()
    }

    /// Splits gaps down to the local maximum cell, then halves cells until neighbours differ
    /// by at most the grading ratio.
    fn fill(&self, fixed: Vec<f64>, max_cell: impl Fn(f64) -> f64) -> Vec<f64> {
        let mut lines = Vec::with_capacity(fixed.len() * 4);
        for pair in fixed.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let limit = max_cell(a).min(max_cell(b)).min(max_cell(0.5 * (a + b)));
            let n = ((b - a) / limit).ceil().max(1.0) as usize;
            let step = (b - a) / n as f64;
            lines.extend((0..n).map(|i| a + step * i as f64));
        }
        if let Some(last) = fixed.last() {
            lines.push(*last);
        }

        let ratio = self.config.grading_ratio;
        let min_cell = 2.0 * self.config.min_spacing_mm;
        for _ in 0..MAX_GRADING_PASSES {
            let cells: Vec<f64> = lines.windows(2).map(|w| w[1] - w[0]).collect();
            let mut split = Vec::new();
            for (i, cell) in cells.iter().enumerate() {
                let left = if i > 0 { cells[i - 1] } else { f64::INFINITY };
                let right = cells.get(i + 1).copied().unwrap_or(f64::INFINITY);
                if *cell > ratio * left.min(right) && *cell >= min_cell {
                    split.push(lines[i] + cell / 2.0);
                }
            }
            if split.is_empty() {
                break;
            }
            lines.extend(split);
            lines.sort_by(f64::total_cmp);
        }
        lines
    }
}

fn pml_lines(
    domain: (f64, f64),
    faces: (BoundaryCondition, BoundaryCondition),
    cell: f64,
) -> Vec<Line> {
    let mut lines = Vec::new();
    if let BoundaryCondition::Pml { cells } = faces.0 {
        lines.extend((1..=cells).map(|i| Line::pinned(domain.0 - cell * i as f64)));
    }
    if let BoundaryCondition::Pml { cells } = faces.1 {
        lines.extend((1..=cells).map(|i| Line::pinned(domain.1 + cell * i as f64)));
    }
    lines
}

/// Sorts and collapses lines closer than `min_spacing`. Pinned lines keep their position.
fn merge_lines(mut lines: Vec<Line>, min_spacing: f64) -> Vec<f64> {
    lines.sort_by(|a, b| a.coord.total_cmp(&b.coord));
    let mut merged: Vec<Line> = Vec::with_capacity(lines.len());
    for line in lines {
        let Some(last) = merged.last_mut() else {
            merged.push(line);
            continue;
        };
        if line.coord - last.coord >= min_spacing {
            merged.push(line);
            continue;
        }
        match (last.pinned, line.pinned) {
            (true, true) => {
                if line.coord - last.coord > COINCIDENT_MM {
                    merged.push(line);
                }
            }
            (true, false) => {}
            (false, true) => *last = line,
            (false, false) => last.coord = 0.5 * (last.coord + line.coord),
        }
    }
    merged.into_iter().map(|l| l.coord).collect()
}

/// Axis-aligned conductor boundaries, split into edges of constant x and constant y.
fn conductor_edges(board: &BoardModel) -> (Vec<Edge>, Vec<Edge>) {
    let mut x_edges = Vec::new();
    let mut y_edges = Vec::new();
    for polygon in board.layers.values().flatten() {
        let orientation = polygon.signed_area().signum();
        for (a, b) in polygon.edges() {
            if (a.x - b.x).abs() < COINCIDENT_MM {
                x_edges.push(Edge {
                    coord: a.x,
                    metal_side: -(b.y - a.y).signum() * orientation,
                });
            } else if (a.y - b.y).abs() < COINCIDENT_MM {
                y_edges.push(Edge {
                    coord: a.y,
                    metal_side: (b.x - a.x).signum() * orientation,
                });
            } else {
                for p in [a, b] {
                    x_edges.push(Edge { coord: p.x, metal_side: 0.0 });
                    y_edges.push(Edge { coord: p.y, metal_side: 0.0 });
                }
            }
        }
    }
    for via in &board.vias {
        let r = via.diameter_mm / 2.0;
        x_edges.push(Edge { coord: via.position.x - r, metal_side: 1.0 });
        x_edges.push(Edge { coord: via.position.x + r, metal_side: -1.0 });
        y_edges.push(Edge { coord: via.position.y - r, metal_side: 1.0 });
        y_edges.push(Edge { coord: via.position.y + r, metal_side: -1.0 });
    }
    (x_edges, y_edges)
}

fn check_ports(board: &BoardModel, regions: &[MaterialRegion]) -> Result<()> {
    let mut grid_layers: BTreeMap<&str, usize> = BTreeMap::new();
    for region in regions {
        if let Some(layer) = region.layer.as_deref() {
            *grid_layers.entry(layer).or_default() += 1;
        }
    }
    for port in &board.ports {
        for layer in [&port.layer, &port.reference_layer] {
            if !grid_layers.contains_key(layer.as_str()) {
                return Err(RfError::DegenerateGeometry {
                    reason: format!(
                        "port {} references layer '{}' which is absent from the material grid",
                        port.number, layer
                    ),
                });
            }
        }
        if !board.port_has_conductor(port) {
            return Err(RfError::DegenerateGeometry {
                reason: format!(
                    "port {} has no adjacent conductor on '{}'",
                    port.number, port.layer
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::board::BoardModelBuilder;
    use crate::core::synthesis::{GeometrySynthesizer, SynthesisConfig};
    use crate::domain::board::Point;
    use crate::domain::model::{ElectricalTarget, StructureKind, SubstrateStack};

    fn board(kind: StructureKind) -> BoardModel {
        let stack = SubstrateStack::two_layer(4.3, 1.6, 35.0, 0.02);
        let geometry = GeometrySynthesizer::new(kind, SynthesisConfig::default())
            .synthesize(&ElectricalTarget::new(50.0, 2.45e9), &stack)
            .unwrap();
        BoardModelBuilder::new(50.0).build(&geometry, &stack).unwrap()
    }

    fn range() -> FrequencyRange {
        FrequencyRange::around(2.45e9, 0.2, 101)
    }

    #[test]
    fn test_no_conductor_edge_on_a_mesh_line() {
        for kind in [StructureKind::Microstrip, StructureKind::Patch, StructureKind::Gcpw] {
            let board = board(kind);
            let domain = MeshConverter::default().convert(&board, &range()).unwrap();
            let (x_edges, y_edges) = conductor_edges(&board);
            for edge in &x_edges {
                assert!(domain.mesh.x.iter().all(|x| (x - edge.coord).abs() > COINCIDENT_MM));
            }
            for edge in &y_edges {
                assert!(domain.mesh.y.iter().all(|y| (y - edge.coord).abs() > COINCIDENT_MM));
            }
        }
    }

    #[test]
    fn test_lines_strictly_increase_and_grade() {
        let domain = MeshConverter::default()
            .convert(&board(StructureKind::Patch), &range())
            .unwrap();
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let lines = domain.mesh.axis(axis);
            let cells: Vec<f64> = lines.windows(2).map(|w| w[1] - w[0]).collect();
            assert!(cells.iter().all(|c| *c > 0.0));
            for pair in cells.windows(2) {
                let ratio = pair[0].max(pair[1]) / pair[0].min(pair[1]);
                assert!(ratio <= 1.5 + 1e-9, "{:?} grading {}", axis, ratio);
            }
        }
    }

    #[test]
    fn test_dielectric_interfaces_lie_on_z_lines() {
        let board = board(StructureKind::Microstrip);
        let domain = MeshConverter::default().convert(&board, &range()).unwrap();
        for extent in board.stack.extents() {
            for z in [extent.z_bottom, extent.z_top] {
                assert!(domain.mesh.z.iter().any(|line| (line - z).abs() < 1e-12));
            }
        }
        let inside = domain
            .mesh
            .z
            .iter()
            .filter(|z| **z > 0.035 && **z < 1.635)
            .count();
        assert!(inside >= 3);
    }

    #[test]
    fn test_boundaries_follow_structure() {
        let line = MeshConverter::default()
            .convert(&board(StructureKind::Microstrip), &range())
            .unwrap();
        assert_eq!(line.boundaries.z_min, BoundaryCondition::Pec);
        assert!(line.boundaries.z_max.is_absorbing());

        let patch = MeshConverter::default()
            .convert(&board(StructureKind::Patch), &range())
            .unwrap();
        assert!(patch.boundaries.faces().iter().all(BoundaryCondition::is_absorbing));
        assert_eq!(patch.ports.len(), 1);
        assert_eq!(patch.ports[0].reference_impedance, 50.0);
        assert!(matches!(patch.waveform, Waveform::Gaussian { f0_hz, .. } if (f0_hz - 2.45e9).abs() < 1.0));
    }

    #[test]
    fn test_port_on_missing_layer_is_degenerate() {
        let mut board = board(StructureKind::Microstrip);
        board.ports[0].layer = "In2.Cu".to_string();
        let err = MeshConverter::default().convert(&board, &range()).unwrap_err();
        assert!(matches!(err, RfError::DegenerateGeometry { .. }));
    }

    #[test]
    fn test_zero_area_polygon_is_degenerate() {
        let mut board = board(StructureKind::Microstrip);
        board.layers.get_mut("F.Cu").unwrap().push(Polygon::new(
            vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(2.0, 0.0)],
            None,
        ));
        let err = MeshConverter::default().convert(&board, &range()).unwrap_err();
        assert!(matches!(err, RfError::DegenerateGeometry { .. }));
    }

    #[test]
    fn test_port_without_conductor_is_degenerate() {
        let mut board = board(StructureKind::Microstrip);
        board.ports[1].position = Point::new(100.0, 100.0);
        assert!(matches!(
            MeshConverter::default().convert(&board, &range()),
            Err(RfError::DegenerateGeometry { .. })
        ));
    }
}
