//! Declarative tree annotation: rooting, clade backgrounds, child order and
//! per-leaf styles, loaded from a tab-separated rule file.
//!
//! Rule file lines (`#` starts a comment):
//! ```text
//! root    TGF-beta1
//! clade   MCV_Squalius_cephalus_QCQ67828.1    MCV_Lates_calcarifer_YP_009163772.1    #dce6dc
//! swap    VEGFB_Ovis_aries_XP_027815351.1    VEGFA_Homo_sapiens_NP_001020539.2
//! prefix  Hsa    #9db0cf
//! ```
//! Whatever their order in the file, rules are applied as: root, clades,
//! swaps, leaf styles. A rule naming a leaf that is not in the tree fails the
//! whole annotation.

use crate::tree::{FaceText, Node, NodeStyle, Shape, TextFace, Tree, TreeError};
use log::debug;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

const LEAF_SIZE: f64 = 10.0;
const INTERNAL_SIZE: f64 = 8.0;
const INTERNAL_FGCOLOR: &str = "#000000";
const LABEL_FONT_SIZE: f64 = 12.0;
const LABEL_COLOR: &str = "Black";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Failed to read rule file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Rule file line {line}: {message}")]
    Syntax { line: usize, message: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("Cannot root tree on '{outgroup}': {source}")]
    Rooting {
        outgroup: String,
        #[source]
        source: TreeError,
    },
    #[error("Clade rule ({leaf_a}, {leaf_b}) failed: {source}")]
    Clade {
        leaf_a: String,
        leaf_b: String,
        #[source]
        source: TreeError,
    },
    #[error("Swap rule ({leaf_a}, {leaf_b}) failed: {source}")]
    Swap {
        leaf_a: String,
        leaf_b: String,
        #[source]
        source: TreeError,
    },
}

/// Background for the lowest common ancestor of two leaves and its whole clade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CladeRule {
    pub leaf_a: String,
    pub leaf_b: String,
    pub bgcolor: String,
}

/// Reverses the children of the lowest common ancestor of two leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapRule {
    pub leaf_a: String,
    pub leaf_b: String,
}

/// Colours for every leaf whose name starts with `prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRule {
    pub prefix: String,
    pub bgcolor: String,
    pub fgcolor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationRules {
    pub outgroup: Option<String>,
    pub clades: Vec<CladeRule>,
    pub swaps: Vec<SwapRule>,
    pub leaf_rules: Vec<LeafRule>,
}

impl AnnotationRules {
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let io_err = |source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let reader = BufReader::new(file);

        let mut lines = Vec::new();
        for line in reader.lines() {
            lines.push(line.map_err(io_err)?);
        }
        Self::parse_lines(lines.iter().map(String::as_str))
    }

    pub fn parse(text: &str) -> Result<Self, RuleError> {
        Self::parse_lines(text.lines())
    }

    fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Self, RuleError> {
        let mut rules = AnnotationRules::default();

        for (line_no, line) in lines.enumerate() {
            let line_no = line_no + 1;
            let syntax = |message: String| RuleError::Syntax {
                line: line_no,
                message,
            };
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split('\t').map(str::trim).collect();
            match parts.as_slice() {
                ["root", leaf] => {
                    if rules.outgroup.is_some() {
                        return Err(syntax("more than one root rule".to_string()));
                    }
                    rules.outgroup = Some(leaf.to_string());
                }
                ["clade", a, b, color] => rules.clades.push(CladeRule {
                    leaf_a: a.to_string(),
                    leaf_b: b.to_string(),
                    bgcolor: parse_color(color).map_err(syntax)?,
                }),
                ["swap", a, b] => rules.swaps.push(SwapRule {
                    leaf_a: a.to_string(),
                    leaf_b: b.to_string(),
                }),
                ["prefix", prefix, bg] => rules.leaf_rules.push(LeafRule {
                    prefix: prefix.to_string(),
                    bgcolor: parse_color(bg).map_err(syntax)?,
                    fgcolor: None,
                }),
                ["prefix", prefix, bg, fg] => rules.leaf_rules.push(LeafRule {
                    prefix: prefix.to_string(),
                    bgcolor: parse_color(bg).map_err(syntax)?,
                    fgcolor: Some(parse_color(fg).map_err(syntax)?),
                }),
                [kind @ ("root" | "clade" | "swap" | "prefix"), ..] => {
                    return Err(syntax(format!(
                        "wrong number of tab-separated fields for '{}'",
                        kind
                    )))
                }
                [kind, ..] => return Err(syntax(format!("unknown rule '{}'", kind))),
                [] => {}
            }
        }

        Ok(rules)
    }
}

/// Accepts `#rgb`, `#rrggbb` or a named SVG colour.
fn parse_color(value: &str) -> Result<String, String> {
    let valid = match value.strip_prefix('#') {
        Some(hex) => (hex.len() == 3 || hex.len() == 6) && hex.bytes().all(|b| b.is_ascii_hexdigit()),
        None => !value.is_empty() && value.bytes().all(|b| b.is_ascii_alphabetic()),
    };
    if valid {
        Ok(value.to_string())
    } else {
        Err(format!("invalid colour '{}'", value))
    }
}

// ============================================================================
// Per-node style decisions
// ============================================================================
/// Style fields to overwrite on a node; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StyleDecision {
    pub shape: Option<Shape>,
    pub size: Option<f64>,
    pub fgcolor: Option<String>,
    pub bgcolor: Option<String>,
    pub faces: Option<Vec<TextFace>>,
}

impl StyleDecision {
    pub fn apply_to(self, style: &mut NodeStyle) {
        if let Some(shape) = self.shape {
            style.shape = shape;
        }
        if let Some(size) = self.size {
            style.size = size;
        }
        if let Some(fgcolor) = self.fgcolor {
            style.fgcolor = fgcolor;
        }
        if let Some(bgcolor) = self.bgcolor {
            style.bgcolor = Some(bgcolor);
        }
        if let Some(faces) = self.faces {
            style.faces = faces;
        }
    }
}

/// Default look of a node plus any matching prefix rules, applied in file order.
///
/// Leaves get a circle and two label columns (a blank spacer and the name);
/// internal nodes a smaller black circle.
pub fn leaf_style(node: &Node, rules: &AnnotationRules) -> StyleDecision {
    if !node.is_leaf() {
        return StyleDecision {
            shape: Some(Shape::Circle),
            size: Some(INTERNAL_SIZE),
            fgcolor: Some(INTERNAL_FGCOLOR.to_string()),
            ..StyleDecision::default()
        };
    }

    let label = |text| TextFace {
        text,
        font_size: LABEL_FONT_SIZE,
        color: LABEL_COLOR.to_string(),
    };
    let mut decision = StyleDecision {
        shape: Some(Shape::Circle),
        size: Some(LEAF_SIZE),
        faces: Some(vec![
            label(FaceText::Static(" ".to_string())),
            label(FaceText::NodeName),
        ]),
        ..StyleDecision::default()
    };

    let name = node.name().unwrap_or("");
    for rule in rules.leaf_rules.iter().filter(|r| name.starts_with(&r.prefix)) {
        decision.bgcolor = Some(rule.bgcolor.clone());
        if let Some(fg) = &rule.fgcolor {
            decision.fgcolor = Some(fg.clone());
        }
    }
    decision
}

/// Applies all rules to `tree`.
///
/// Works on a copy: on error `tree` is left exactly as it was.
pub fn annotate(tree: &mut Tree, rules: &AnnotationRules) -> Result<(), AnnotationError> {
    let mut work = tree.clone();

    if let Some(outgroup) = &rules.outgroup {
        work.set_outgroup(outgroup)
            .map_err(|source| AnnotationError::Rooting {
                outgroup: outgroup.clone(),
                source,
            })?;
        debug!("Rooted on {}", outgroup);
    }

    // Resolve every clade before colouring any of them.
    let clades = rules
        .clades
        .iter()
        .map(|rule| {
            work.common_ancestor(&rule.leaf_a, &rule.leaf_b)
                .map(|node| (node, rule))
                .map_err(|source| AnnotationError::Clade {
                    leaf_a: rule.leaf_a.clone(),
                    leaf_b: rule.leaf_b.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    for (ancestor, rule) in clades {
        for index in work.subtree(ancestor) {
            work[index].style.bgcolor = Some(rule.bgcolor.clone());
        }
    }

    for rule in &rules.swaps {
        let ancestor = work
            .common_ancestor(&rule.leaf_a, &rule.leaf_b)
            .map_err(|source| AnnotationError::Swap {
                leaf_a: rule.leaf_a.clone(),
                leaf_b: rule.leaf_b.clone(),
                source,
            })?;
        work.swap_children(ancestor);
    }

    for index in work.pre_order() {
        let decision = leaf_style(&work[index], rules);
        decision.apply_to(&mut work[index].style);
    }

    *tree = work;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newick::parse_str;

    fn bg(tree: &Tree, leaf: &str) -> Option<String> {
        let index = tree.find_leaf(leaf).unwrap();
        tree[index].style.bgcolor.clone()
    }

    fn clade(a: &str, b: &str, color: &str) -> CladeRule {
        CladeRule {
            leaf_a: a.to_string(),
            leaf_b: b.to_string(),
            bgcolor: color.to_string(),
        }
    }

    #[test]
    fn clade_rule_colours_whole_subtree_only() {
        let mut tree = parse_str("((A,B),(C,D));").unwrap();
        let rules = AnnotationRules {
            clades: vec![clade("A", "B", "red")],
            ..AnnotationRules::default()
        };
        annotate(&mut tree, &rules).unwrap();

        let ab = tree.common_ancestor("A", "B").unwrap();
        assert_eq!(tree[ab].style.bgcolor.as_deref(), Some("red"));
        assert_eq!(bg(&tree, "A").as_deref(), Some("red"));
        assert_eq!(bg(&tree, "B").as_deref(), Some("red"));
        assert_eq!(bg(&tree, "C"), None);
        assert_eq!(bg(&tree, "D"), None);
        assert_eq!(tree.root().style.bgcolor, None);
    }

    #[test]
    fn missing_leaf_leaves_tree_untouched() {
        let mut tree = parse_str("((A,B),(C,D));").unwrap();
        let before = tree.clone();
        let rules = AnnotationRules {
            outgroup: Some("C".to_string()),
            clades: vec![clade("A", "B", "red"), clade("C", "X", "blue")],
            ..AnnotationRules::default()
        };

        let err = annotate(&mut tree, &rules).unwrap_err();
        assert_eq!(
            err,
            AnnotationError::Clade {
                leaf_a: "C".to_string(),
                leaf_b: "X".to_string(),
                source: TreeError::LeafNotFound {
                    name: "X".to_string()
                },
            }
        );
        assert_eq!(tree, before);
    }

    #[test]
    fn swap_with_missing_leaf_leaves_tree_untouched() {
        let mut tree = parse_str("((A,B),(C,D));").unwrap();
        let before = tree.clone();
        let rules = AnnotationRules {
            outgroup: Some("C".to_string()),
            clades: vec![clade("A", "B", "red")],
            swaps: vec![
                SwapRule {
                    leaf_a: "A".to_string(),
                    leaf_b: "B".to_string(),
                },
                SwapRule {
                    leaf_a: "D".to_string(),
                    leaf_b: "Y".to_string(),
                },
            ],
            ..AnnotationRules::default()
        };

        let err = annotate(&mut tree, &rules).unwrap_err();
        assert_eq!(
            err,
            AnnotationError::Swap {
                leaf_a: "D".to_string(),
                leaf_b: "Y".to_string(),
                source: TreeError::LeafNotFound {
                    name: "Y".to_string()
                },
            }
        );
        assert_eq!(tree, before);
    }

    #[test]
    fn missing_outgroup_fails() {
        let mut tree = parse_str("((A,B),C);").unwrap();
        let rules = AnnotationRules {
            outgroup: Some("R".to_string()),
            ..AnnotationRules::default()
        };
        assert!(matches!(
            annotate(&mut tree, &rules),
            Err(AnnotationError::Rooting { .. })
        ));
    }

    #[test]
    fn clades_are_looked_up_after_rooting() {
        // Before rooting on D, LCA(A, C) is the root; afterwards it is an inner node.
        let mut tree = parse_str("(A,B,(C,D));").unwrap();
        let rules = AnnotationRules {
            outgroup: Some("D".to_string()),
            clades: vec![clade("A", "C", "#dce6dc")],
            ..AnnotationRules::default()
        };
        annotate(&mut tree, &rules).unwrap();

        assert_eq!(bg(&tree, "D"), None);
        assert_eq!(bg(&tree, "A").as_deref(), Some("#dce6dc"));
        assert_eq!(tree.root().style.bgcolor, None);
    }

    #[test]
    fn swap_rule_reverses_children() {
        let mut tree = parse_str("((A,B),C);").unwrap();
        let rules = AnnotationRules {
            swaps: vec![SwapRule {
                leaf_a: "A".to_string(),
                leaf_b: "C".to_string(),
            }],
            ..AnnotationRules::default()
        };
        annotate(&mut tree, &rules).unwrap();
        assert_eq!(tree.leaf_names(), vec!["C", "A", "B"]);
    }

    #[test]
    fn default_styles_and_prefix_override() {
        let mut tree = parse_str("((Hsa_VEGFA,Mmu_VEGFA),Dre_VEGFA);").unwrap();
        let rules = AnnotationRules {
            leaf_rules: vec![LeafRule {
                prefix: "Hsa".to_string(),
                bgcolor: "#9db0cf".to_string(),
                fgcolor: None,
            }],
            ..AnnotationRules::default()
        };
        annotate(&mut tree, &rules).unwrap();

        let human = &tree[tree.find_leaf("Hsa_VEGFA").unwrap()];
        assert_eq!(human.style.bgcolor.as_deref(), Some("#9db0cf"));
        assert_eq!(human.style.size, LEAF_SIZE);
        assert_eq!(human.style.faces.len(), 2);
        assert_eq!(human.style.faces[0].resolve(human), " ");
        assert_eq!(human.style.faces[1].resolve(human), "Hsa_VEGFA");

        assert_eq!(bg(&tree, "Mmu_VEGFA"), None);
        let root = tree.root();
        assert_eq!(root.style.size, INTERNAL_SIZE);
        assert_eq!(root.style.fgcolor, INTERNAL_FGCOLOR);
        assert!(root.style.faces.is_empty());
    }

    #[test]
    fn prefix_colour_wins_over_clade_background() {
        let mut tree = parse_str("((Hsa_1,Mmu_1),Dre_1);").unwrap();
        let rules = AnnotationRules::parse(
            "clade\tHsa_1\tMmu_1\t#ffff99\nprefix\tHsa\t#9db0cf\n",
        )
        .unwrap();
        annotate(&mut tree, &rules).unwrap();

        assert_eq!(bg(&tree, "Hsa_1").as_deref(), Some("#9db0cf"));
        assert_eq!(bg(&tree, "Mmu_1").as_deref(), Some("#ffff99"));
    }

    #[test]
    fn parses_rule_file() {
        let text = "# VEGF dataset\n\
                    root\tTGF-beta1\n\
                    clade\tVEGFB_Homo_sapiens_AAL79000.1\tVEGFB_Cervus_elaphus_OWK17446.1\t#ffff99\n\
                    \n\
                    swap\tA\tB\n\
                    prefix\tHsa\t#9db0cf\tWhite\n";
        let rules = AnnotationRules::parse(text).unwrap();

        assert_eq!(rules.outgroup.as_deref(), Some("TGF-beta1"));
        assert_eq!(rules.clades[0].bgcolor, "#ffff99");
        assert_eq!(rules.swaps.len(), 1);
        assert_eq!(rules.leaf_rules[0].fgcolor.as_deref(), Some("White"));
    }

    #[test]
    fn rule_errors_name_the_line() {
        let err = AnnotationRules::parse("root\tA\nclade\tA\tB\n").unwrap_err();
        assert!(matches!(err, RuleError::Syntax { line: 2, .. }));

        let err = AnnotationRules::parse("colour\tA\n").unwrap_err();
        assert!(matches!(err, RuleError::Syntax { line: 1, .. }));

        let err = AnnotationRules::parse("\n\nprefix\tHsa\t#12345\n").unwrap_err();
        assert!(matches!(err, RuleError::Syntax { line: 3, .. }));

        let err = AnnotationRules::parse("root\tA\nroot\tB\n").unwrap_err();
        assert!(matches!(err, RuleError::Syntax { line: 2, .. }));
    }
}
