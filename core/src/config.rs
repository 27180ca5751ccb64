//! Static configuration (spec.md §6 "Configuration").
//!
//! The real config-file tokenizer is an external collaborator (spec.md §1);
//! this module only holds the parsed values and a minimal `key = value`
//! reader good enough for tests and for `blockmgrd` to load a file at
//! startup.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Global allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutMode {
    /// Blocks come only from the static layout; nothing is synthesized.
    Static,
    /// Like `Static`, but the configured blocks may overlap.
    Overlap,
    /// The allocator may synthesize new blocks on demand.
    #[default]
    Dynamic,
}

impl FromStr for LayoutMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STATIC" => Ok(Self::Static),
            "OVERLAP" => Ok(Self::Overlap),
            "DYNAMIC" => Ok(Self::Dynamic),
            other => Err(format!("unknown LayoutMode {other:?}")),
        }
    }
}

/// Per-block connection type request, as configured for a static block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTypeCfg {
    Torus,
    Mesh,
    Small,
}

/// Small-block split counts, keyed by sub-block size in compute nodes.
/// Only the sizes meaningful for the configured `MidplaneNodeCnt` are
/// populated; e.g. a 1024-node-per-midplane 4-D system uses 16/32/64/128/256.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmallBlockSplit {
    pub counts: HashMap<u32, u32>,
}

impl SmallBlockSplit {
    pub fn total_nodes(&self) -> u32 {
        self.counts.iter().map(|(size, count)| size * count).sum()
    }
}

/// One entry of an image permission list (spec.md §4.6 step 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub name: String,
    /// Empty means unrestricted.
    pub permitted_groups: HashSet<String>,
}

impl ImageEntry {
    pub fn permits(&self, groups: &HashSet<String>) -> bool {
        self.permitted_groups.is_empty() || !self.permitted_groups.is_disjoint(groups)
    }
}

/// The four independently-tracked image lists named in spec.md §4.6 and
/// `bg_read_config.c` (blrts, linux, ramdisk, mloader); kept as separate
/// lists rather than one map-of-kind because each kind's default and
/// alternates are configured independently.
#[derive(Debug, Clone, Default)]
pub struct ImageList {
    pub blrts: Vec<ImageEntry>,
    pub linux: Vec<ImageEntry>,
    pub ramdisk: Vec<ImageEntry>,
    pub mloader: Vec<ImageEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Blrts,
    Linux,
    Ramdisk,
    Mloader,
}

impl ImageList {
    fn list(&self, kind: ImageKind) -> &[ImageEntry] {
        match kind {
            ImageKind::Blrts => &self.blrts,
            ImageKind::Linux => &self.linux,
            ImageKind::Ramdisk => &self.ramdisk,
            ImageKind::Mloader => &self.mloader,
        }
    }

    /// Looks up `name` in the list for `kind` and checks whether `groups`
    /// is permitted to use it. An unrecognized name is treated as
    /// unrestricted, on the assumption that it will fail image validation
    /// elsewhere rather than silently widening a restricted image.
    pub fn check_permission(
        &self,
        kind: ImageKind,
        name: &str,
        groups: &HashSet<String>,
    ) -> bool {
        match self.list(kind).iter().find(|e| e.name == name) {
            Some(entry) => entry.permits(groups),
            None => true,
        }
    }
}

/// Dimensions in which a passthrough is forbidden (spec.md §4.4).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DenyPassthrough {
    #[default]
    None,
    All,
    Dims(HashSet<usize>),
}

impl DenyPassthrough {
    pub fn denies(&self, dim: usize) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Dims(dims) => dims.contains(&dim),
        }
    }
}

/// Everything in spec.md §6 "Configuration".
#[derive(Debug, Clone)]
pub struct Config {
    pub layout_mode: LayoutMode,
    pub midplane_node_cnt: u32,
    pub nodecard_node_cnt: u32,
    pub ionodes_per_mp: u32,
    pub deny_passthrough: DenyPassthrough,
    pub bridge_api_log_file: Option<String>,
    pub bridge_api_verbose: bool,
    pub images: ImageList,
    /// Percent, 0-100.
    pub max_block_err: u8,
    pub allow_sub_block_allocations: bool,
    pub sub_midplane_system: bool,
    pub small_block_split: SmallBlockSplit,
    /// Per-dimension machine size, length 3 or 4.
    pub dim_sizes: Vec<u32>,
    /// Per-dimension wraparound.
    pub wraps: Vec<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layout_mode: LayoutMode::default(),
            midplane_node_cnt: 512,
            nodecard_node_cnt: 32,
            ionodes_per_mp: 16,
            deny_passthrough: DenyPassthrough::default(),
            bridge_api_log_file: None,
            bridge_api_verbose: false,
            images: ImageList::default(),
            max_block_err: 0,
            allow_sub_block_allocations: true,
            sub_midplane_system: false,
            small_block_split: SmallBlockSplit::default(),
            dim_sizes: vec![4, 4, 4],
            wraps: vec![true, true, true],
        }
    }
}

impl Config {
    pub fn dimensionality(&self) -> usize {
        self.dim_sizes.len()
    }

    pub fn nodecards_per_mp(&self) -> u32 {
        self.midplane_node_cnt / self.nodecard_node_cnt.max(1)
    }

    /// Parses a minimal `key = value` config file, one directive per line,
    /// `#` starting a comment. Good enough for tests and for `blockmgrd`'s
    /// startup; a real options grammar is an external collaborator
    /// (spec.md §1).
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut cfg = Self::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(format!("line {}: expected key = value", lineno + 1));
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "LayoutMode" => cfg.layout_mode = value.parse()?,
                "MidplaneNodeCnt" => cfg.midplane_node_cnt = parse_u32(key, value)?,
                "NodeCardNodeCnt" => cfg.nodecard_node_cnt = parse_u32(key, value)?,
                "IONodesPerMP" => cfg.ionodes_per_mp = parse_u32(key, value)?,
                "DenyPassthrough" => {
                    cfg.deny_passthrough = if value.eq_ignore_ascii_case("ALL") {
                        DenyPassthrough::All
                    } else if value.is_empty() {
                        DenyPassthrough::None
                    } else {
                        DenyPassthrough::Dims(
                            value
                                .split(',')
                                .map(|d| dim_letter(d.trim()))
                                .collect::<Result<_, _>>()?,
                        )
                    };
                }
                "BridgeAPILogFile" => cfg.bridge_api_log_file = Some(value.to_string()),
                "BridgeAPIVerbose" => cfg.bridge_api_verbose = parse_bool(key, value)?,
                "MaxBlockInError" => cfg.max_block_err = parse_u32(key, value)? as u8,
                "AllowSubBlockAllocations" => {
                    cfg.allow_sub_block_allocations = parse_bool(key, value)?
                }
                "SubMidplaneSystem" => cfg.sub_midplane_system = parse_bool(key, value)?,
                _ => return Err(format!("line {}: unknown directive {key:?}", lineno + 1)),
            }
        }
        Ok(cfg)
    }
}

fn dim_letter(s: &str) -> Result<usize, String> {
    match s {
        "A" | "X" | "a" | "x" => Ok(0),
        "B" | "Y" | "b" | "y" => Ok(1),
        "C" | "Z" | "c" | "z" => Ok(2),
        "D" | "d" => Ok(3),
        other => Err(format!("unknown dimension letter {other:?}")),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, String> {
    value
        .parse()
        .map_err(|_| format!("{key}: expected an integer, got {value:?}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(format!("{key}: expected a boolean, got {value:?}")),
    }
}

impl fmt::Display for LayoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Static => "STATIC",
            Self::Overlap => "OVERLAP",
            Self::Dynamic => "DYNAMIC",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_directives() {
        let cfg = Config::parse(
            "LayoutMode = DYNAMIC\nMidplaneNodeCnt = 1024\n# a comment\nDenyPassthrough = A,C\n",
        )
        .unwrap();
        assert_eq!(cfg.layout_mode, LayoutMode::Dynamic);
        assert_eq!(cfg.midplane_node_cnt, 1024);
        assert!(cfg.deny_passthrough.denies(0));
        assert!(!cfg.deny_passthrough.denies(1));
        assert!(cfg.deny_passthrough.denies(2));
    }

    #[test]
    fn rejects_unknown_directive() {
        assert!(Config::parse("Bogus = 1").is_err());
    }

    #[test]
    fn image_permission_defaults_to_open() {
        let list = ImageList::default();
        let groups: HashSet<String> = ["users".to_string()].into_iter().collect();
        assert!(list.check_permission(ImageKind::Linux, "default", &groups));
    }

    #[test]
    fn image_permission_restricts_by_group() {
        let mut list = ImageList::default();
        list.mloader.push(ImageEntry {
            name: "debug-mloader".to_string(),
            permitted_groups: ["admins".to_string()].into_iter().collect(),
        });
        let users: HashSet<String> = ["users".to_string()].into_iter().collect();
        let admins: HashSet<String> = ["admins".to_string()].into_iter().collect();
        assert!(!list.check_permission(ImageKind::Mloader, "debug-mloader", &users));
        assert!(list.check_permission(ImageKind::Mloader, "debug-mloader", &admins));
    }
}
