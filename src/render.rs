//! SVG rendering of an annotated tree as a rectangular phylogram.
//!
//! Branch lengths run left to right (`x = distance from root * scale`),
//! leaves take one row each in display order and an internal node sits
//! halfway between its first and last child.

use crate::tree::{Node, NodeIndex, NodeStyle, Shape, Tree};
use log::debug;
use rustc_hash::FxHashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MARGIN: f64 = 10.0;
const MIN_ROW_HEIGHT: f64 = 14.0;
const ROW_PADDING: f64 = 4.0;
const LABEL_GAP: f64 = 4.0;
const BRANCH_FONT_SIZE: f64 = 9.0;
/// Length used for branches without one, so topology-only trees still spread out.
const DEFAULT_BRANCH_LENGTH: f64 = 1.0;
const MM_PER_INCH: f64 = 25.4;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to write image '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Mm,
    In,
    Px,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self {
            Unit::Mm => "mm",
            Unit::In => "in",
            Unit::Px => "px",
        };
        write!(f, "{}", suffix)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    /// Pixels per unit of branch length.
    pub scale: f64,
    /// Draws the leaf name next to the tip, in addition to any label columns.
    pub show_leaf_name: bool,
    pub show_branch_length: bool,
    pub show_branch_support: bool,
    /// Aligns label columns at the right-most tip and joins tips to them with dotted lines.
    pub draw_guiding_lines: bool,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub unit: Unit,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            scale: 270.0,
            show_leaf_name: false,
            show_branch_length: false,
            show_branch_support: true,
            draw_guiding_lines: true,
            width: None,
            height: Some(340.0),
            unit: Unit::Mm,
        }
    }
}

impl RenderConfig {
    /// Physical `(width, height)` for a drawing of `view_width` x `view_height` pixels.
    /// A missing dimension follows the drawing's aspect ratio.
    fn physical_size(&self, view_width: f64, view_height: f64) -> (f64, f64) {
        let px_per_unit = match self.unit {
            Unit::Px => 1.0,
            // CSS reference pixel: 96 per inch
            Unit::In => 96.0,
            Unit::Mm => 96.0 / MM_PER_INCH,
        };
        match (self.width, self.height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) => (w, w * view_height / view_width),
            (None, Some(h)) => (h * view_width / view_height, h),
            (None, None) => (view_width / px_per_unit, view_height / px_per_unit),
        }
    }
}

/// Supplies the style of each node at render time.
///
/// Called exactly once per node. It only sees the tree through a shared
/// reference, so it cannot change the topology being drawn.
pub trait NodeLayout {
    fn style(&self, tree: &Tree, index: NodeIndex) -> NodeStyle;
}

impl<F> NodeLayout for F
where
    F: Fn(&Node) -> NodeStyle,
{
    fn style(&self, tree: &Tree, index: NodeIndex) -> NodeStyle {
        self(&tree[index])
    }
}

/// Uses the style already stored on each node by annotation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredStyles;

impl NodeLayout for StoredStyles {
    fn style(&self, tree: &Tree, index: NodeIndex) -> NodeStyle {
        tree[index].style.clone()
    }
}

/// Escape special XML characters
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Approximate width of `text` at `font_size`.
fn text_width(text: &str, font_size: f64) -> f64 {
    text.chars().count() as f64 * font_size * 0.6
}

/// One text cell to the right of a leaf.
struct Label {
    text: String,
    font_size: f64,
    color: String,
}

/// Computed positions, in pixels.
struct Layout {
    x: Vec<f64>,
    y: Vec<f64>,
    /// First and last leaf row covered by each node's clade.
    rows: Vec<(usize, usize)>,
    row_height: f64,
    num_rows: usize,
}

fn compute_layout(tree: &Tree, styles: &[NodeStyle], scale: f64) -> Layout {
    let n = tree.num_nodes();
    let order = tree.pre_order();
    let mut x = vec![MARGIN; n];
    let mut y = vec![0.0; n];
    let mut rows = vec![(0, 0); n];

    let row_height = tree
        .leaves()
        .into_iter()
        .map(|leaf| {
            let style = &styles[leaf];
            style
                .faces
                .iter()
                .map(|f| f.font_size)
                .fold(style.size, f64::max)
                + ROW_PADDING
        })
        .fold(MIN_ROW_HEIGHT, f64::max);

    for &index in &order {
        if let Some(parent) = tree[index].parent() {
            let length = tree[index].branch_length().unwrap_or(DEFAULT_BRANCH_LENGTH);
            x[index] = x[parent] + length.max(0.0) * scale;
        }
    }

    let mut next_row = 0;
    for &index in &order {
        if tree[index].is_leaf() {
            rows[index] = (next_row, next_row);
            y[index] = MARGIN + (next_row as f64 + 0.5) * row_height;
            next_row += 1;
        }
    }
    for &index in order.iter().rev() {
        let children = tree[index].children();
        if let (Some(&first), Some(&last)) = (children.first(), children.last()) {
            y[index] = (y[first] + y[last]) / 2.0;
            rows[index] = (rows[first].0, rows[last].1);
        }
    }

    Layout {
        x,
        y,
        rows,
        row_height,
        num_rows: next_row,
    }
}

fn draw_shape(svg: &mut String, style: &NodeStyle, cx: f64, cy: f64, gradients: &FxHashMap<String, usize>) {
    if style.size <= 0.0 {
        return;
    }
    let r = style.size / 2.0;
    let color = escape_xml(&style.fgcolor);
    match style.shape {
        Shape::Circle => svg.push_str(&format!(
            r#"<circle cx="{:.2}" cy="{:.2}" r="{:.2}" fill="{}"/>"#,
            cx, cy, r, color
        )),
        Shape::Square => svg.push_str(&format!(
            r#"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="{}"/>"#,
            cx - r,
            cy - r,
            style.size,
            style.size,
            color
        )),
        Shape::Sphere => {
            let id = gradients.get(&style.fgcolor).copied().unwrap_or(0);
            svg.push_str(&format!(
                r##"<circle cx="{:.2}" cy="{:.2}" r="{:.2}" fill="url(#sphere{})"/>"##,
                cx, cy, r, id
            ))
        }
    }
    svg.push('\n');
}

/// Render tree as SVG with vector fonts
pub fn render_svg(tree: &Tree, config: &RenderConfig, layout: &dyn NodeLayout) -> String {
    let order = tree.pre_order();
    let mut styles = vec![NodeStyle::default(); tree.num_nodes()];
    for &index in &order {
        styles[index] = layout.style(tree, index);
    }

    let pos = compute_layout(tree, &styles, config.scale);
    let leaves = tree.leaves();

    // Label columns per leaf, in column order
    let labels: FxHashMap<NodeIndex, Vec<Label>> = leaves
        .iter()
        .map(|&leaf| {
            let node = &tree[leaf];
            let style = &styles[leaf];
            let mut cells: Vec<Label> = style
                .faces
                .iter()
                .map(|face| Label {
                    text: face.resolve(node).to_string(),
                    font_size: face.font_size,
                    color: face.color.clone(),
                })
                .collect();
            if config.show_leaf_name {
                cells.push(Label {
                    text: node.name().unwrap_or("").to_string(),
                    font_size: style.size.max(10.0),
                    color: "black".to_string(),
                });
            }
            (leaf, cells)
        })
        .collect();

    let num_columns = labels.values().map(Vec::len).max().unwrap_or(0);
    let column_widths: Vec<f64> = (0..num_columns)
        .map(|c| {
            labels
                .values()
                .filter_map(|cells| cells.get(c))
                .map(|cell| text_width(&cell.text, cell.font_size) + LABEL_GAP)
                .fold(0.0, f64::max)
        })
        .collect();
    let labels_total: f64 = column_widths.iter().sum();

    let tip_edge = |leaf: NodeIndex| pos.x[leaf] + styles[leaf].size.max(0.0) / 2.0;
    let aligned_x = leaves.iter().map(|&l| tip_edge(l)).fold(MARGIN, f64::max) + LABEL_GAP;
    let label_start = |leaf: NodeIndex| {
        if config.draw_guiding_lines {
            aligned_x
        } else {
            tip_edge(leaf) + LABEL_GAP
        }
    };

    let content_right = leaves
        .iter()
        .map(|&l| label_start(l) + labels_total)
        .fold(aligned_x, f64::max);
    let view_width = content_right + MARGIN;
    let view_height = pos.num_rows.max(1) as f64 * pos.row_height + 2.0 * MARGIN;
    let (phys_w, phys_h) = config.physical_size(view_width, view_height);

    let mut svg = String::new();

    // SVG header
    svg.push_str(&format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="{:.2}{unit}" height="{:.2}{unit}" viewBox="0 0 {:.2} {:.2}">
<style>
  text {{ font-family: 'DejaVu Sans', Arial, sans-serif; }}
  .branch-info {{ font-size: {}px; fill: #555555; }}
</style>
<rect width="100%" height="100%" fill="white"/>
"#,
        phys_w,
        phys_h,
        view_width,
        view_height,
        BRANCH_FONT_SIZE,
        unit = config.unit
    ));

    // Gradients for sphere nodes, one per colour in first-use order
    let mut gradients: FxHashMap<String, usize> = FxHashMap::default();
    let mut defs = String::new();
    for &index in &order {
        let style = &styles[index];
        if style.shape == Shape::Sphere && !gradients.contains_key(&style.fgcolor) {
            let id = gradients.len();
            gradients.insert(style.fgcolor.clone(), id);
            defs.push_str(&format!(
                r#"<radialGradient id="sphere{}" cx="0.35" cy="0.35" r="0.65"><stop offset="0" stop-color="white"/><stop offset="1" stop-color="{}"/></radialGradient>"#,
                id,
                escape_xml(&style.fgcolor)
            ));
            defs.push('\n');
        }
    }
    if !defs.is_empty() {
        svg.push_str("<defs>\n");
        svg.push_str(&defs);
        svg.push_str("</defs>\n");
    }

    // Clade backgrounds; descendants come later and paint over their ancestors
    for &index in &order {
        if let Some(bg) = &styles[index].bgcolor {
            let start_x = tree[index].parent().map_or(pos.x[index], |p| pos.x[p]);
            let (first, last) = pos.rows[index];
            let top = MARGIN + first as f64 * pos.row_height;
            let height = (last - first + 1) as f64 * pos.row_height;
            svg.push_str(&format!(
                r#"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="{}"/>"#,
                start_x,
                top,
                content_right - start_x,
                height,
                escape_xml(bg)
            ));
            svg.push('\n');
        }
    }

    // Branches
    for &index in &order {
        let node = &tree[index];
        let style = &styles[index];
        if let Some(parent) = node.parent() {
            svg.push_str(&format!(
                r#"<line x1="{:.2}" y1="{:.2}" x2="{:.2}" y2="{:.2}" stroke="{}" stroke-width="1"/>"#,
                pos.x[parent],
                pos.y[index],
                pos.x[index],
                pos.y[index],
                escape_xml(&style.hz_line_color)
            ));
            svg.push('\n');

            let mid_x = (pos.x[parent] + pos.x[index]) / 2.0;
            if config.show_branch_support && !node.is_leaf() {
                if let Some(support) = node.support() {
                    svg.push_str(&format!(
                        r#"<text x="{:.2}" y="{:.2}" class="branch-info" text-anchor="middle">{}</text>"#,
                        mid_x,
                        pos.y[index] - 2.0,
                        support
                    ));
                    svg.push('\n');
                }
            }
            if config.show_branch_length {
                if let Some(length) = node.branch_length() {
                    svg.push_str(&format!(
                        r#"<text x="{:.2}" y="{:.2}" class="branch-info" text-anchor="middle">{}</text>"#,
                        mid_x,
                        pos.y[index] + BRANCH_FONT_SIZE + 1.0,
                        length
                    ));
                    svg.push('\n');
                }
            }
        }
        if let (Some(&first), Some(&last)) = (node.children().first(), node.children().last()) {
            svg.push_str(&format!(
                r#"<line x1="{:.2}" y1="{:.2}" x2="{:.2}" y2="{:.2}" stroke="{}" stroke-width="1"/>"#,
                pos.x[index],
                pos.y[first],
                pos.x[index],
                pos.y[last],
                escape_xml(&style.vt_line_color)
            ));
            svg.push('\n');
        }
    }

    // Guide lines from tips to their aligned labels
    if config.draw_guiding_lines {
        for &leaf in &leaves {
            if labels[&leaf].is_empty() || tip_edge(leaf) >= aligned_x - LABEL_GAP {
                continue;
            }
            svg.push_str(&format!(
                r##"<line x1="{:.2}" y1="{:.2}" x2="{:.2}" y2="{:.2}" stroke="#999999" stroke-width="0.5" stroke-dasharray="2,2"/>"##,
                tip_edge(leaf),
                pos.y[leaf],
                aligned_x - LABEL_GAP / 2.0,
                pos.y[leaf]
            ));
            svg.push('\n');
        }
    }

    // Node symbols
    for &index in &order {
        draw_shape(&mut svg, &styles[index], pos.x[index], pos.y[index], &gradients);
    }

    // Leaf labels
    for &leaf in &leaves {
        let mut x = label_start(leaf);
        for (column, cell) in labels[&leaf].iter().enumerate() {
            if !cell.text.trim().is_empty() {
                svg.push_str(&format!(
                    r#"<text x="{:.2}" y="{:.2}" font-size="{}" fill="{}">{}</text>"#,
                    x,
                    pos.y[leaf] + cell.font_size / 3.0,
                    cell.font_size,
                    escape_xml(&cell.color),
                    escape_xml(&cell.text)
                ));
                svg.push('\n');
            }
            x += column_widths[column];
        }
    }

    // Close SVG
    svg.push_str("</svg>\n");

    debug!(
        "Rendered {} nodes on {} rows ({:.0}x{:.0} px)",
        order.len(),
        pos.num_rows,
        view_width,
        view_height
    );
    svg
}

/// Renders `tree` and writes the SVG to `path`.
pub fn render(
    tree: &Tree,
    config: &RenderConfig,
    layout: &dyn NodeLayout,
    path: &Path,
) -> Result<(), RenderError> {
    let svg = render_svg(tree, config, layout);
    std::fs::write(path, svg).map_err(|source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    })
}
