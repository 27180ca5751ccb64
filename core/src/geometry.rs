//! Coordinate and geometry utilities (spec.md §4.1, component C1).
//!
//! Coordinates are encoded one digit per dimension in base 36 (`0-9a-z`),
//! the same alphabet the original plugin's `alpha_num` table uses, so a
//! 4-D machine up to size 36 per dimension can be written as a 4-character
//! string like `"a2f0"`.

use crate::error::CoreError;

const ALPHA_NUM: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encodes a single coordinate component (0-35) as its base-36 digit.
pub fn encode_digit(value: u32) -> Result<char, CoreError> {
    ALPHA_NUM
        .get(value as usize)
        .map(|&b| b as char)
        .ok_or(CoreError::InvalidInput)
}

/// Decodes a single base-36 digit character back to its value.
pub fn decode_digit(c: char) -> Result<u32, CoreError> {
    let c = c.to_ascii_lowercase();
    ALPHA_NUM
        .iter()
        .position(|&b| b as char == c)
        .map(|p| p as u32)
        .ok_or(CoreError::InvalidInput)
}

/// A coordinate vector, one component per torus dimension.
pub type Coord = Vec<u32>;

/// Encodes a full coordinate as a string of base-36 digits, one per
/// dimension, e.g. `(1, 0, 15)` -> `"10f"`.
pub fn encode_coord(coord: &[u32]) -> Result<String, CoreError> {
    coord.iter().copied().map(encode_digit).collect()
}

/// Decodes a coordinate string back into its component vector.
pub fn decode_coord(s: &str) -> Result<Coord, CoreError> {
    s.chars().map(decode_digit).collect()
}

/// Converts an N-D coordinate to the canonical 1-D row-major index into a
/// grid of the given per-dimension sizes.
pub fn coord_to_index(coord: &[u32], dim_sizes: &[u32]) -> usize {
    let mut index = 0usize;
    for (c, size) in coord.iter().zip(dim_sizes) {
        index = index * (*size as usize) + *c as usize;
    }
    index
}

/// Inverse of [`coord_to_index`].
pub fn index_to_coord(mut index: usize, dim_sizes: &[u32]) -> Coord {
    let mut coord = vec![0u32; dim_sizes.len()];
    for (d, size) in dim_sizes.iter().enumerate().rev() {
        let size = *size as usize;
        coord[d] = (index % size) as u32;
        index /= size;
    }
    coord
}

/// Parses hostlist-style coordinate ranges of the form `AAAA,BBBB` (two
/// single points) or `[AAAAxBBBB]` (a rectangular range, every point
/// between the two corners inclusive) into the list of coordinate vectors
/// they cover.
pub fn parse_range(spec: &str, dims: usize) -> Result<Vec<Coord>, CoreError> {
    let spec = spec.trim();
    if let Some(inner) = spec.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let (start, end) = inner
            .split_once('x')
            .ok_or(CoreError::InvalidInput)?;
        let start = decode_coord(start)?;
        let end = decode_coord(end)?;
        if start.len() != dims || end.len() != dims {
            return Err(CoreError::InvalidInput);
        }
        Ok(enumerate_rectangle(&start, &end))
    } else if let Some((a, b)) = spec.split_once(',') {
        let a = decode_coord(a.trim())?;
        let b = decode_coord(b.trim())?;
        if a.len() != dims || b.len() != dims {
            return Err(CoreError::InvalidInput);
        }
        Ok(vec![a, b])
    } else {
        let c = decode_coord(spec)?;
        if c.len() != dims {
            return Err(CoreError::InvalidInput);
        }
        Ok(vec![c])
    }
}

fn enumerate_rectangle(start: &[u32], end: &[u32]) -> Vec<Coord> {
    let dims = start.len();
    let mut out = vec![vec![0u32; dims]];
    for d in 0..dims {
        let (lo, hi) = (start[d].min(end[d]), start[d].max(end[d]));
        let mut next = Vec::with_capacity(out.len() * (hi - lo + 1) as usize);
        for coord in &out {
            for v in lo..=hi {
                let mut c = coord.clone();
                c[d] = v;
                next.push(c);
            }
        }
        out = next;
    }
    out
}

/// Returns every unique permutation of `geo`'s axes: 6 for a 3-vector, 24
/// for a 4-vector, fewer if some components are equal (rotating an axis
/// with an identical neighbor produces the same vector, and duplicates are
/// removed).
pub fn rotations(geo: &[u32]) -> Vec<Vec<u32>> {
    let mut indices: Vec<usize> = (0..geo.len()).collect();
    let mut perms = Vec::new();
    permute(&mut indices, 0, &mut perms);
    let mut out: Vec<Vec<u32>> = perms
        .into_iter()
        .map(|idx| idx.into_iter().map(|i| geo[i]).collect())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn permute(indices: &mut [usize], start: usize, out: &mut Vec<Vec<usize>>) {
    if start == indices.len() {
        out.push(indices.to_vec());
        return;
    }
    for i in start..indices.len() {
        indices.swap(start, i);
        permute(indices, start + 1, out);
        indices.swap(start, i);
    }
}

/// One candidate geometry returned by [`enumerate_geometries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoCandidate {
    pub geo: Vec<u32>,
    /// Number of dimensions with extent > 1, i.e. how many axes this
    /// geometry actually spans. Geometries with a higher count are
    /// preferred (spec.md §4.1): they tile the requested size without
    /// leaving it concentrated into a long, thin shape.
    pub full_dim_count: usize,
}

/// Enumerates every geometry vector of length `dim_sizes.len()` whose
/// product is exactly `size` and whose each component divides the
/// corresponding machine dimension size, grouped with full-dimension-count
/// geometries first.
pub fn enumerate_geometries(size: u32, dim_sizes: &[u32]) -> Vec<GeoCandidate> {
    let mut out = Vec::new();
    let mut geo = vec![0u32; dim_sizes.len()];
    enumerate_rec(size, dim_sizes, 0, &mut geo, &mut out);
    out.sort_by(|a, b| {
        b.full_dim_count
            .cmp(&a.full_dim_count)
            .then_with(|| a.geo.cmp(&b.geo))
    });
    out.dedup_by(|a, b| a.geo == b.geo);
    out
}

fn enumerate_rec(
    remaining: u32,
    dim_sizes: &[u32],
    dim: usize,
    geo: &mut Vec<u32>,
    out: &mut Vec<GeoCandidate>,
) {
    if dim == dim_sizes.len() {
        if remaining == 1 {
            let full_dim_count = geo.iter().filter(|&&v| v > 1).count();
            out.push(GeoCandidate {
                geo: geo.clone(),
                full_dim_count,
            });
        }
        return;
    }
    let max = dim_sizes[dim];
    let mut v = 1;
    while v <= max {
        if max % v == 0 && remaining % v == 0 {
            geo[dim] = v;
            enumerate_rec(remaining / v, dim_sizes, dim + 1, geo, out);
        }
        v += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_round_trips() {
        for v in 0..36 {
            assert_eq!(decode_digit(encode_digit(v).unwrap()).unwrap(), v);
        }
    }

    #[test]
    fn coord_round_trips_through_index() {
        let dims = [4u32, 4, 4];
        for i in 0..64usize {
            let c = index_to_coord(i, &dims);
            assert_eq!(coord_to_index(&c, &dims), i);
        }
    }

    #[test]
    fn coord_string_round_trips() {
        let c = vec![1u32, 0, 15];
        let s = encode_coord(&c).unwrap();
        assert_eq!(s, "10f");
        assert_eq!(decode_coord(&s).unwrap(), c);
    }

    #[test]
    fn rectangle_range_covers_every_point() {
        let pts = parse_range("[000x110]", 3).unwrap();
        assert_eq!(pts.len(), 2 * 2 * 1);
    }

    #[test]
    fn rotations_of_3d_geo_has_six_unless_degenerate() {
        assert_eq!(rotations(&[2, 2, 2]).len(), 1);
        assert_eq!(rotations(&[1, 2, 4]).len(), 6);
        assert_eq!(rotations(&[2, 2, 4]).len(), 3);
    }

    #[test]
    fn rotations_of_4d_geo_has_up_to_24() {
        assert_eq!(rotations(&[1, 2, 3, 4]).len(), 24);
    }

    #[test]
    fn enumerate_geometries_prefers_full_dimension_count() {
        let cands = enumerate_geometries(8, &[4, 4, 4]);
        assert_eq!(cands[0].full_dim_count, 3);
        assert!(cands
            .iter()
            .all(|c| c.geo.iter().product::<u32>() == 8));
    }

    #[test]
    fn enumerate_geometries_order_independent_of_seed() {
        // Enumerating with dims given forward or mirrored yields the same
        // multiset of full-dimension counts (R3 in spec.md §8), since the
        // recursion is symmetric in which axis is filled first.
        let a = enumerate_geometries(16, &[4, 4, 4]);
        let mut dim_sizes_rev = vec![4u32, 4, 4];
        dim_sizes_rev.reverse();
        let b = enumerate_geometries(16, &dim_sizes_rev);
        let mut a_counts: Vec<usize> = a.iter().map(|c| c.full_dim_count).collect();
        let mut b_counts: Vec<usize> = b.iter().map(|c| c.full_dim_count).collect();
        a_counts.sort();
        b_counts.sort();
        assert_eq!(a_counts, b_counts);
    }
}
