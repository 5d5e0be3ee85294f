//! Fabrication package: RS-274X copper, solder mask and outline layers, an Excellon drill
//! file, and a stack-up description carrying what a fabrication converter cannot infer from
//! copper alone.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use zip::write::{FileOptions, ZipWriter};

use crate::domain::board::{BoardModel, Point};
use crate::domain::model::{ConductorRole, StackLayer};
use crate::utils::error::Result;

const OUTLINE_APERTURE_MM: f64 = 0.05;
/// Mask opening margin around every exposed pad.
const MASK_EXPANSION_MM: f64 = 0.05;

/// Gerber coordinates in the 4.6 format are integer nanometres.
fn coord(mm: f64) -> i64 {
    (mm * 1e6).round() as i64
}

fn xy(p: &Point) -> String {
    format!("X{}Y{}", coord(p.x), coord(p.y))
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn gerber_header(out: &mut String, function: &str) {
    out.push_str(&format!(
        "%TF.GenerationSoftware,rfsynth,rfsynth,{}*%\n",
        env!("CARGO_PKG_VERSION")
    ));
    out.push_str(&format!("%TF.FileFunction,{}*%\n", function));
    out.push_str("%FSLAX46Y46*%\n");
    out.push_str("%MOMM*%\n");
    out.push_str("%LPD*%\n");
    out.push_str("G01*\n");
}

fn circle(diameter_mm: f64) -> String {
    format!("C,{:.4}", diameter_mm)
}

fn rectangle(width_mm: f64, height_mm: f64) -> String {
    format!("R,{:.4}X{:.4}", width_mm, height_mm)
}

/// Flash positions keyed by aperture template (`C,0.6000`, `R,1.0000X1.0000`).
type Flashes = BTreeMap<String, Vec<Point>>;

/// Declares one aperture per template, numbered from D10, and returns the codes in order.
fn define_apertures(out: &mut String, flashes: &Flashes) -> Vec<usize> {
    let codes: Vec<usize> = (10..10 + flashes.len()).collect();
    for (code, template) in codes.iter().zip(flashes.keys()) {
        out.push_str(&format!("%ADD{}{}*%\n", code, template));
    }
    codes
}

fn flash_all(out: &mut String, codes: &[usize], flashes: &Flashes) {
    for (code, points) in codes.iter().zip(flashes.values()) {
        out.push_str(&format!("D{}*\n", code));
        for point in points {
            out.push_str(&format!("{}D03*\n", xy(point)));
        }
    }
}

fn side_name(board: &BoardModel, layer: &str) -> &'static str {
    match board.stack.conductor(layer).map(|c| c.role) {
        Some(ConductorRole::Top) => "Top",
        Some(ConductorRole::Bottom) => "Bot",
        _ => "Inr",
    }
}

/// Via pads on `layer`, grown by `expansion_mm` on every side.
fn via_pads(board: &BoardModel, layer: &str, expansion_mm: f64, flashes: &mut Flashes) {
    for via in board
        .vias
        .iter()
        .filter(|v| v.connected_layers.iter().any(|l| l == layer))
    {
        flashes
            .entry(circle(via.diameter_mm + 2.0 * expansion_mm))
            .or_default()
            .push(via.position);
    }
}

/// One copper layer: every polygon as a G36/G37 region, via pads flashed on top.
pub fn copper_gerber(board: &BoardModel, layer: &str) -> String {
    let mut out = String::new();
    let position = board
        .stack
        .conductors()
        .position(|c| c.name == layer)
        .map(|i| i + 1)
        .unwrap_or(0);
    gerber_header(&mut out, &format!("Copper,L{},{}", position, side_name(board, layer)));

    let mut flashes = Flashes::new();
    via_pads(board, layer, 0.0, &mut flashes);
    let codes = define_apertures(&mut out, &flashes);

    for polygon in board.polygons(layer) {
        let Some(first) = polygon.vertices.first() else {
            continue;
        };
        out.push_str("G36*\n");
        out.push_str(&format!("{}D02*\n", xy(first)));
        for vertex in polygon.vertices.iter().skip(1).chain(std::iter::once(first)) {
            out.push_str(&format!("{}D01*\n", xy(vertex)));
        }
        out.push_str("G37*\n");
    }

    flash_all(&mut out, &codes, &flashes);
    out.push_str("M02*\n");
    out
}

/// Mask openings over an outer copper layer: via pads and the square launch pad under every
/// port on that layer. Dark areas are openings.
pub fn solder_mask_gerber(board: &BoardModel, layer: &str) -> String {
    let mut out = String::new();
    gerber_header(&mut out, &format!("Soldermask,{}", side_name(board, layer)));

    let mut flashes = Flashes::new();
    via_pads(board, layer, MASK_EXPANSION_MM, &mut flashes);
    for port in board.ports.iter().filter(|p| p.layer == layer) {
        let side = port.width_mm + 2.0 * MASK_EXPANSION_MM;
        flashes
            .entry(rectangle(side, side))
            .or_default()
            .push(port.position);
    }
    let codes = define_apertures(&mut out, &flashes);
    flash_all(&mut out, &codes, &flashes);
    out.push_str("M02*\n");
    out
}

pub fn outline_gerber(board: &BoardModel) -> String {
    let mut out = String::new();
    gerber_header(&mut out, "Profile,NP");
    out.push_str(&format!("%ADD10C,{:.4}*%\n", OUTLINE_APERTURE_MM));
    out.push_str("D10*\n");
    let o = board.outline;
    let corners = [
        Point::new(o.min_x, o.min_y),
        Point::new(o.max_x, o.min_y),
        Point::new(o.max_x, o.max_y),
        Point::new(o.min_x, o.max_y),
    ];
    out.push_str(&format!("{}D02*\n", xy(&corners[0])));
    for corner in corners.iter().skip(1).chain(std::iter::once(&corners[0])) {
        out.push_str(&format!("{}D01*\n", xy(corner)));
    }
    out.push_str("M02*\n");
    out
}

/// Plated through holes, one tool per drill size. `None` without vias.
pub fn excellon_drill(board: &BoardModel) -> Option<String> {
    if board.vias.is_empty() {
        return None;
    }
    let sizes: BTreeSet<String> = board.vias.iter().map(|v| format!("{:.3}", v.drill_mm)).collect();
    let tools: Vec<(usize, String)> = sizes.into_iter().enumerate().map(|(i, s)| (i + 1, s)).collect();

    let mut out = String::new();
    out.push_str("M48\n");
    out.push_str("; DRILL file generated by rfsynth\n");
    out.push_str("; FORMAT={-:-/ absolute / metric / decimal}\n");
    out.push_str("METRIC\n");
    for (tool, size) in &tools {
        out.push_str(&format!("T{}C{}\n", tool, size));
    }
    out.push_str("%\n");
    out.push_str("G90\n");
    out.push_str("G05\n");
    for (tool, size) in &tools {
        out.push_str(&format!("T{}\n", tool));
        for via in board.vias.iter().filter(|v| &format!("{:.3}", v.drill_mm) == size) {
            out.push_str(&format!("X{:.4}Y{:.4}\n", via.position.x, via.position.y));
        }
    }
    out.push_str("T0\n");
    out.push_str("M30\n");
    Some(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackupEntry {
    pub name: String,
    pub kind: String,
    pub thickness_mm: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permittivity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_tangent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conductivity_s_per_m: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackupDescription {
    pub board: String,
    pub total_thickness_mm: f64,
    pub layers: Vec<StackupEntry>,
}

pub fn stackup_description(board: &BoardModel) -> StackupDescription {
    let mut dielectric_index = 0;
    let layers = board
        .stack
        .layers
        .iter()
        .map(|layer| match layer {
            StackLayer::Conductor(c) => StackupEntry {
                name: c.name.clone(),
                kind: "copper".to_string(),
                thickness_mm: c.thickness_mm,
                material: None,
                permittivity: None,
                loss_tangent: None,
                conductivity_s_per_m: Some(c.conductivity_s_per_m),
            },
            StackLayer::Dielectric(d) => {
                dielectric_index += 1;
                StackupEntry {
                    name: format!("dielectric {}", dielectric_index),
                    kind: "dielectric".to_string(),
                    thickness_mm: d.thickness_mm,
                    material: Some(d.material.clone()),
                    permittivity: Some(d.permittivity),
                    loss_tangent: Some(d.loss_tangent),
                    conductivity_s_per_m: None,
                }
            }
        })
        .collect();
    StackupDescription {
        board: board.name.clone(),
        total_thickness_mm: board.stack.total_thickness_mm(),
        layers,
    }
}

/// Every fabrication file as `(path inside the bundle, content)`.
pub fn fabrication_files(board: &BoardModel) -> Result<Vec<(String, Vec<u8>)>> {
    let stem = file_stem(&board.name);
    let mut files = Vec::new();
    for conductor in board.stack.conductors() {
        files.push((
            format!("fabrication/{}-{}.gbr", stem, file_stem(&conductor.name)),
            copper_gerber(board, &conductor.name).into_bytes(),
        ));
    }
    for (role, mask) in [(ConductorRole::Top, "F_Mask"), (ConductorRole::Bottom, "B_Mask")] {
        if let Some(conductor) = board.stack.conductor_with_role(role) {
            files.push((
                format!("fabrication/{}-{}.gbr", stem, mask),
                solder_mask_gerber(board, &conductor.name).into_bytes(),
            ));
        }
    }
    files.push((
        format!("fabrication/{}-Edge_Cuts.gbr", stem),
        outline_gerber(board).into_bytes(),
    ));
    if let Some(drill) = excellon_drill(board) {
        files.push((format!("fabrication/{}.drl", stem), drill.into_bytes()));
    }
    files.push((
        "fabrication/stackup.json".to_string(),
        serde_json::to_vec_pretty(&stackup_description(board))?,
    ));
    tracing::debug!("📦 {} fabrication files for '{}'", files.len(), board.name);
    Ok(files)
}

pub fn bundle_zip(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in files {
        zip.start_file::<_, ()>(name.as_str(), FileOptions::default())?;
        zip.write_all(data)?;
    }
    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::board::BoardModelBuilder;
    use crate::core::synthesis::{GeometrySynthesizer, SynthesisConfig};
    use crate::domain::model::{ElectricalTarget, StructureKind, SubstrateStack};
    use std::io::{BufReader, Read};

    /// Debug renderings of the commands a Gerber reader recovers from `gerber`.
    fn parsed_commands(gerber: &str) -> Vec<String> {
        match gerber_parser::parse(BufReader::new(gerber.as_bytes())) {
            Ok(doc) => doc.into_commands().iter().map(|c| format!("{:?}", c)).collect(),
            Err(e) => panic!("Gerber output does not parse: {:?}", e),
        }
    }

    fn count(commands: &[String], needle: &str) -> usize {
        commands.iter().filter(|c| c.contains(needle)).count()
    }

    fn board(kind: StructureKind) -> BoardModel {
        let stack = SubstrateStack::two_layer(4.3, 1.6, 35.0, 0.02);
        let geometry = GeometrySynthesizer::new(kind, SynthesisConfig::default())
            .synthesize(&ElectricalTarget::new(50.0, 2.45e9), &stack)
            .unwrap();
        BoardModelBuilder::new(50.0)
            .with_name("fab test")
            .build(&geometry, &stack)
            .unwrap()
    }

    #[test]
    fn test_copper_layer_has_one_region_per_polygon() {
        let board = board(StructureKind::Patch);
        let gerber = copper_gerber(&board, "F.Cu");
        assert_eq!(gerber.matches("G36*").count(), board.polygons("F.Cu").len());
        assert!(gerber.contains("%TF.FileFunction,Copper,L1,Top*%"));
        assert!(gerber.ends_with("M02*\n"));

        let commands = parsed_commands(&gerber);
        assert_eq!(count(&commands, "RegionMode(true)"), board.polygons("F.Cu").len());
        assert!(commands.last().is_some_and(|c| c.contains("EndOfFile")));
    }

    #[test]
    fn test_via_pads_are_flashed_on_both_copper_layers() {
        let gcpw = board(StructureKind::Gcpw);
        assert!(!gcpw.vias.is_empty());
        for layer in ["F.Cu", "B.Cu"] {
            let commands = parsed_commands(&copper_gerber(&gcpw, layer));
            assert_eq!(count(&commands, "Flash"), gcpw.vias.len(), "{}", layer);
        }
    }

    #[test]
    fn test_solder_mask_opens_ports_and_vias() {
        let gcpw = board(StructureKind::Gcpw);
        let top = solder_mask_gerber(&gcpw, "F.Cu");
        assert!(top.contains("%TF.FileFunction,Soldermask,Top*%"));
        assert!(!top.contains("G36*"));
        let ports_on_top = gcpw.ports.iter().filter(|p| p.layer == "F.Cu").count();
        assert!(ports_on_top > 0);
        let commands = parsed_commands(&top);
        assert_eq!(count(&commands, "Flash"), gcpw.vias.len() + ports_on_top);

        let via = &gcpw.vias[0];
        let opening = format!("C,{:.4}", via.diameter_mm + 2.0 * MASK_EXPANSION_MM);
        assert!(top.contains(&opening), "missing {}", opening);

        let bottom = solder_mask_gerber(&gcpw, "B.Cu");
        assert!(bottom.contains("%TF.FileFunction,Soldermask,Bot*%"));
        assert_eq!(count(&parsed_commands(&bottom), "Flash"), gcpw.vias.len());
    }

    #[test]
    fn test_outline_is_a_closed_profile() {
        let patch = board(StructureKind::Patch);
        let gerber = outline_gerber(&patch);
        assert!(gerber.contains("%TF.FileFunction,Profile,NP*%"));
        let commands = parsed_commands(&gerber);
        assert_eq!(count(&commands, "Interpolate"), 4);
        assert!(commands.last().is_some_and(|c| c.contains("EndOfFile")));
    }

    #[test]
    fn test_drill_only_with_vias() {
        assert!(excellon_drill(&board(StructureKind::Microstrip)).is_none());
        let gcpw = board(StructureKind::Gcpw);
        let drill = excellon_drill(&gcpw).unwrap();
        let holes = drill.lines().filter(|l| l.starts_with('X')).count();
        assert_eq!(holes, gcpw.vias.len());
        assert!(drill.contains("T1C0.300"));
    }

    #[test]
    fn test_stackup_carries_dielectric_properties() {
        let description = stackup_description(&board(StructureKind::Microstrip));
        let dielectric = &description.layers[1];
        assert_eq!(dielectric.permittivity, Some(4.3));
        assert_eq!(dielectric.loss_tangent, Some(0.02));
        assert!((description.total_thickness_mm - 1.67).abs() < 1e-9);
    }

    #[test]
    fn test_bundle_contains_every_file() {
        let files = fabrication_files(&board(StructureKind::Gcpw)).unwrap();
        let bytes = bundle_zip(&files).unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), files.len());
        let mut stackup = String::new();
        archive
            .by_name("fabrication/stackup.json")
            .unwrap()
            .read_to_string(&mut stackup)
            .unwrap();
        assert!(stackup.contains("\"permittivity\": 4.3"));
        assert!(archive.by_name("fabrication/fab_test-F_Cu.gbr").is_ok());
        assert!(archive.by_name("fabrication/fab_test-F_Mask.gbr").is_ok());
        assert!(archive.by_name("fabrication/fab_test-B_Mask.gbr").is_ok());

        for (name, data) in files.iter().filter(|(n, _)| n.ends_with(".gbr")) {
            let text = std::str::from_utf8(data).unwrap();
            assert!(!parsed_commands(text).is_empty(), "{} is empty", name);
        }
    }
}
