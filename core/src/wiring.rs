//! Wiring/feasibility engine (spec.md §4.4, component C4).
//!
//! Builds the scratch `alter_switch` state for a candidate block and either
//! commits it to `axis_switch` or reverts every partial change, leaking no
//! state on failure (spec.md §4.4, §8 invariant 4, property R2).

use crate::block::ConnType;
use crate::config::DenyPassthrough;
use crate::error::{CoreError, Result};
use crate::grid::{Grid, SwitchModel, SwitchUsage, UsedState};

/// The outcome of a successful [`check_and_set`] call.
#[derive(Debug, Clone)]
pub struct WiringResult {
    /// Midplanes the block itself owns, lexicographic by coord.
    pub owned: Vec<Vec<u32>>,
    /// Midplanes used only as a passthrough for this block's wires.
    pub passthrough: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Copy)]
struct Touch {
    mp_idx: usize,
    dim: usize,
}

/// Every line through the block's footprint parallel to `dim`: the
/// starting index of one line per combination of the other dimensions'
/// offsets within `[0, geo[other])`. A rectangular block has one switch
/// conflict to check per line per dimension, not just along the single
/// line anchored at `start` (spec.md §4.4: the whole footprint's wiring
/// must be reserved, not only its anchor corner's).
fn block_lines(grid: &Grid, start: &[u32], geo: &[u32], dim: usize) -> Vec<usize> {
    let dims = start.len();
    let mut coords: Vec<Vec<u32>> = vec![start.to_vec()];
    for d in 0..dims {
        if d == dim {
            continue;
        }
        let size = grid.dim_sizes[d];
        let mut next = Vec::with_capacity(coords.len() * geo[d] as usize);
        for base in &coords {
            for offset in 0..geo[d] {
                let mut c = base.clone();
                c[d] = (start[d] + offset) % size;
                next.push(c);
            }
        }
        coords = next;
    }
    coords.iter().map(|c| grid.index_of(c)).collect()
}

/// Walks `count` midplanes starting at `start`, following `next_mp[dim]`
/// each step. Used both for a plain mesh/torus span and for tracing a full
/// ring when a torus dimension is narrower than the machine.
fn walk(grid: &Grid, start_idx: usize, dim: usize, count: u32) -> Result<Vec<usize>> {
    let mut path = Vec::with_capacity(count as usize);
    let mut cur = start_idx;
    for _ in 0..count {
        path.push(cur);
        if let Some(next) = grid.midplanes[cur].next_mp[dim] {
            cur = next;
        } else if path.len() < count as usize {
            // Ran off a non-wrapping boundary before covering the request.
            return Err(CoreError::NoSpace);
        }
    }
    Ok(path)
}

/// Attempts to reserve switch ports along a torus/mesh path for every
/// dimension of the requested geometry, starting at `start`. On conflict,
/// reverts all partial `alter_switch` changes and returns failure; on
/// success, commits to `axis_switch`.
pub fn check_and_set(
    grid: &mut Grid,
    start: &[u32],
    geo: &[u32],
    conn_type: &[ConnType],
    deny_passthrough: &DenyPassthrough,
) -> Result<WiringResult> {
    let dims = grid.dim_sizes.len();
    if geo.len() != dims || conn_type.len() != dims || start.len() != dims {
        return Err(CoreError::InvalidInput);
    }

    let mut touched: Vec<Touch> = Vec::new();
    let mut owned_idx: Vec<usize> = Vec::new();
    let mut pass_idx: Vec<usize> = Vec::new();

    let result = (|| -> Result<()> {
        for dim in 0..dims {
            if let ConnType::Small | ConnType::Nav = conn_type[dim] {
                return Err(CoreError::InvalidInput);
            }
            let line_starts = block_lines(grid, start, geo, dim);
            let dim_size = grid.dim_sizes[dim];

            for line_start in line_starts {
                match conn_type[dim] {
                    ConnType::Mesh => {
                        let path = walk(grid, line_start, dim, geo[dim])?;
                        assign_mesh(grid, &path, dim, &mut touched)?;
                        owned_idx.extend(&path);
                    }
                    ConnType::Torus if geo[dim] == 1 => {
                        let path = walk(grid, line_start, dim, 1)?;
                        set_usage(grid, path[0], dim, SwitchUsage::TORUS, &mut touched)?;
                        owned_idx.push(path[0]);
                    }
                    ConnType::Torus if geo[dim] == dim_size => {
                        let path = walk(grid, line_start, dim, dim_size)?;
                        for &mp in &path {
                            set_usage(grid, mp, dim, SwitchUsage::TORUS, &mut touched)?;
                        }
                        owned_idx.extend(&path);
                    }
                    ConnType::Torus => {
                        let full = walk(grid, line_start, dim, dim_size)?;
                        let (owned, passthrough) = full.split_at(geo[dim] as usize);
                        if !passthrough.is_empty() && deny_passthrough.denies(dim) {
                            return Err(CoreError::PassthroughDenied);
                        }
                        for &mp in owned {
                            set_usage(grid, mp, dim, SwitchUsage::TORUS, &mut touched)?;
                        }
                        for &mp in passthrough {
                            set_usage(grid, mp, dim, SwitchUsage::PASS, &mut touched)?;
                        }
                        owned_idx.extend(owned);
                        pass_idx.extend(passthrough);
                    }
                    ConnType::Small | ConnType::Nav => unreachable!("checked above"),
                }
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        revert(grid, &touched);
        return Err(e);
    }

    commit(grid, &touched, &owned_idx, &pass_idx);

    owned_idx.sort_unstable();
    owned_idx.dedup();
    pass_idx.sort_unstable();
    pass_idx.dedup();
    // Midplanes reused by more than one dimension as passthrough but owned
    // by another dimension's span stay owned; passthrough never overrides
    // ownership.
    pass_idx.retain(|p| !owned_idx.contains(p));

    Ok(WiringResult {
        owned: owned_idx
            .iter()
            .map(|&i| grid.midplanes[i].coord.clone())
            .collect(),
        passthrough: pass_idx
            .iter()
            .map(|&i| grid.midplanes[i].coord.clone())
            .collect(),
    })
}

/// A mesh through d midplanes consumes `WRAPPED` on one end and `OUT` on
/// the others (spec.md §4.4).
fn assign_mesh(grid: &mut Grid, path: &[usize], dim: usize, touched: &mut Vec<Touch>) -> Result<()> {
    for (i, &mp) in path.iter().enumerate() {
        let usage = if i == 0 {
            SwitchUsage::WRAPPED
        } else {
            SwitchUsage::OUT
        };
        set_usage(grid, mp, dim, usage, touched)?;
    }
    Ok(())
}

fn set_usage(
    grid: &mut Grid,
    mp_idx: usize,
    dim: usize,
    usage: SwitchUsage,
    touched: &mut Vec<Touch>,
) -> Result<()> {
    let mp = &mut grid.midplanes[mp_idx];
    let existing = mp.axis_switch[dim].get_usage();
    if existing.conflicts_with(usage) {
        return Err(CoreError::NoSpace);
    }
    mp.alter_switch[dim].set_usage(existing | usage);
    mp.used.insert(UsedState::ALTERED);
    touched.push(Touch { mp_idx, dim });
    Ok(())
}

fn revert(grid: &mut Grid, touched: &[Touch]) {
    for t in touched {
        let mp = &mut grid.midplanes[t.mp_idx];
        let committed = mp.axis_switch[t.dim].get_usage();
        mp.alter_switch[t.dim].set_usage(committed);
    }
    let mut cleared = std::collections::HashSet::new();
    for t in touched {
        if cleared.insert(t.mp_idx) {
            grid.midplanes[t.mp_idx].used.remove(UsedState::ALTERED);
        }
    }
}

fn commit(grid: &mut Grid, touched: &[Touch], owned: &[usize], passthrough: &[usize]) {
    let mut settled = std::collections::HashSet::new();
    for t in touched {
        let mp = &mut grid.midplanes[t.mp_idx];
        let usage = mp.alter_switch[t.dim].get_usage();
        mp.axis_switch[t.dim].set_usage(usage);
        if settled.insert(t.mp_idx) {
            mp.used.remove(UsedState::ALTERED);
        }
    }
    for &i in owned {
        grid.midplanes[i].used.insert(UsedState::TRUE);
    }
    for &i in passthrough {
        if !owned.contains(&i) {
            grid.midplanes[i].used.insert(UsedState::PASS);
        }
    }
}

/// Clears the committed usage set by a prior successful [`check_and_set`]
/// on exactly the midplanes/dimensions that call touched (spec.md §4.2
/// "On block free").
pub fn free_wiring(grid: &mut Grid, owned: &[Vec<u32>], passthrough: &[Vec<u32>], dims_used: &[usize]) {
    for coord in owned.iter().chain(passthrough.iter()) {
        let idx = grid.index_of(coord);
        for &dim in dims_used {
            grid.midplanes[idx].axis_switch[dim].set_usage(SwitchUsage::empty());
            grid.midplanes[idx].alter_switch[dim].set_usage(SwitchUsage::empty());
        }
    }
    for coord in owned {
        let idx = grid.index_of(coord);
        grid.midplanes[idx].used.remove(UsedState::TRUE);
    }
    for coord in passthrough {
        let idx = grid.index_of(coord);
        grid.midplanes[idx].used.remove(UsedState::PASS);
    }
}
