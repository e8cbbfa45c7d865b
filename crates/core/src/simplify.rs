//! Zoom-scaled geometry simplification.
//!
//! Douglas–Peucker over integer coordinates. The tolerance is one tile pixel
//! at the target zoom: `2^(Z_INTERNAL - z)` fixed units (the tile covers
//! `2^(Z_INTERNAL - z) * 4096` fixed units and is rendered at 4096 extent).
//! At `z >= Z_INTERNAL` simplification is the identity. Polygon rings whose
//! simplified area falls below threshold are dropped; a polygon losing all
//! rings becomes [`FixedGeometry::Null`].

use crate::fixed::{ring_area2, FixedGeometry, FixedPoint, FixedPolygon, FixedPolyline};
use crate::Z_INTERNAL;

/// Simplification tolerance in fixed units at zoom `z`.
pub fn tolerance_for_zoom(z: u8) -> i64 {
    1i64 << (Z_INTERNAL.saturating_sub(z) as u32)
}

/// Simplify a geometry for rendering at zoom `z`. Points pass through
/// unchanged; at `z >= Z_INTERNAL` everything does.
pub fn simplify(geometry: &FixedGeometry, z: u8) -> FixedGeometry {
    if z >= Z_INTERNAL {
        return geometry.clone();
    }
    let tolerance = tolerance_for_zoom(z);

    match geometry {
        FixedGeometry::Null => FixedGeometry::Null,
        FixedGeometry::Point(p) => FixedGeometry::Point(*p),
        FixedGeometry::Polyline(polyline) => {
            let lines: Vec<_> = polyline
                .lines
                .iter()
                .map(|line| douglas_peucker(line, tolerance))
                .filter(|line| line.len() >= 2)
                .collect();
            if lines.is_empty() {
                FixedGeometry::Null
            } else {
                FixedGeometry::Polyline(FixedPolyline { lines })
            }
        }
        FixedGeometry::Polygon(polygon) => {
            // Rings below ~2x2 pixels are invisible at this zoom.
            let area_threshold = 4 * tolerance as u128 * tolerance as u128;
            let mut parts = Vec::new();
            for part in &polygon.parts {
                let outer = simplify_ring(&part.outer, tolerance);
                if ring_area2(&outer).unsigned_abs() < area_threshold {
                    continue;
                }
                let inner = part
                    .inner
                    .iter()
                    .map(|ring| simplify_ring(ring, tolerance))
                    .filter(|ring| ring_area2(ring).unsigned_abs() >= area_threshold)
                    .collect();
                parts.push(crate::fixed::FixedPolygonPart { outer, inner });
            }
            if parts.is_empty() {
                FixedGeometry::Null
            } else {
                FixedGeometry::Polygon(FixedPolygon { parts })
            }
        }
    }
}

/// Simplify a ring by running Douglas–Peucker over the closed vertex loop.
fn simplify_ring(ring: &[FixedPoint], tolerance: i64) -> Vec<FixedPoint> {
    if ring.len() < 4 {
        return ring.to_vec();
    }
    let mut closed = ring.to_vec();
    closed.push(ring[0]);
    let mut simplified = douglas_peucker(&closed, tolerance);
    simplified.pop();
    simplified
}

/// Classic Douglas–Peucker with an explicit keep-mask and a work stack.
/// Distances are compared in `f64`; the tolerance test needs no exactness
/// and world-scale squared cross products overflow 128-bit integers.
fn douglas_peucker(line: &[FixedPoint], tolerance: i64) -> Vec<FixedPoint> {
    if line.len() <= 2 {
        return line.to_vec();
    }

    let mut keep = vec![false; line.len()];
    keep[0] = true;
    keep[line.len() - 1] = true;

    let tolerance_sq = tolerance as f64 * tolerance as f64;
    let mut stack = vec![(0usize, line.len() - 1)];

    while let Some((first, last)) = stack.pop() {
        if last <= first + 1 {
            continue;
        }
        let mut max_dist_sq = 0.0f64;
        let mut index = first;
        for i in (first + 1)..last {
            let dist_sq = perp_distance_sq(line[i], line[first], line[last]);
            if dist_sq > max_dist_sq {
                max_dist_sq = dist_sq;
                index = i;
            }
        }
        if max_dist_sq > tolerance_sq {
            keep[index] = true;
            stack.push((first, index));
            stack.push((index, last));
        }
    }

    line.iter()
        .zip(&keep)
        .filter_map(|(p, &k)| k.then_some(*p))
        .collect()
}

/// Squared perpendicular distance of `p` from segment `a`–`b` (squared
/// distance to `a` when the segment is degenerate).
fn perp_distance_sq(p: FixedPoint, a: FixedPoint, b: FixedPoint) -> f64 {
    let dx = (b.x - a.x) as f64;
    let dy = (b.y - a.y) as f64;
    let ex = (p.x - a.x) as f64;
    let ey = (p.y - a.y) as f64;
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return ex * ex + ey * ey;
    }
    let cross = dx * ey - dy * ex;
    cross * cross / len_sq
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{FixedPolygonPart, FixedPolyline};

    fn line(points: &[(i64, i64)]) -> Vec<FixedPoint> {
        points.iter().map(|&(x, y)| FixedPoint::new(x, y)).collect()
    }

    #[test]
    fn test_point_unchanged() {
        let p = FixedGeometry::Point(FixedPoint::new(1, 2));
        assert_eq!(simplify(&p, 0), p);
    }

    #[test]
    fn test_identity_at_internal_zoom() {
        let g = FixedGeometry::Polyline(FixedPolyline {
            lines: vec![line(&[(0, 0), (1, 1), (2, 0), (3, 1), (4, 0)])],
        });
        assert_eq!(simplify(&g, Z_INTERNAL), g);
    }

    #[test]
    fn test_collinear_points_removed() {
        let g = FixedGeometry::Polyline(FixedPolyline {
            lines: vec![line(&[(0, 0), (1 << 20, 0), (2 << 20, 0), (3 << 20, 0)])],
        });
        match simplify(&g, 10) {
            FixedGeometry::Polyline(p) => {
                assert_eq!(p.lines[0], line(&[(0, 0), (3 << 20, 0)]));
            }
            other => panic!("expected polyline, got {other:?}"),
        }
    }

    #[test]
    fn test_large_deviation_kept() {
        // A spike much larger than the zoom-10 tolerance (2^10 units).
        let g = FixedGeometry::Polyline(FixedPolyline {
            lines: vec![line(&[(0, 0), (1 << 20, 1 << 16), (2 << 20, 0)])],
        });
        match simplify(&g, 10) {
            FixedGeometry::Polyline(p) => assert_eq!(p.lines[0].len(), 3),
            other => panic!("expected polyline, got {other:?}"),
        }
    }

    #[test]
    fn test_vertex_count_monotonic() {
        let g = FixedGeometry::Polyline(FixedPolyline {
            lines: vec![(0..50)
                .map(|i| FixedPoint::new(i << 16, if i % 2 == 0 { 0 } else { 1 << 14 }))
                .collect()],
        });
        let mut previous = g.vertex_count();
        for z in [0u8, 5, 10, 15, Z_INTERNAL] {
            let count = simplify(&g, z).vertex_count();
            assert!(count <= g.vertex_count());
            assert!(previous <= count || z == 0, "zoom {z}: {previous} > {count}");
            previous = count;
        }
        assert_eq!(simplify(&g, Z_INTERNAL), g);
    }

    #[test]
    fn test_small_polygon_dropped_to_null() {
        // A 16x16-unit square vanishes at zoom 0 (tolerance 2^20).
        let g = FixedGeometry::Polygon(FixedPolygon {
            parts: vec![FixedPolygonPart {
                outer: line(&[(0, 0), (16, 0), (16, 16), (0, 16)]),
                inner: vec![],
            }],
        });
        assert_eq!(simplify(&g, 0), FixedGeometry::Null);
        assert!(!simplify(&g, Z_INTERNAL).is_null());
    }

    #[test]
    fn test_polygon_hole_dropped_outer_kept() {
        let outer_size = 1i64 << 28;
        let g = FixedGeometry::Polygon(FixedPolygon {
            parts: vec![FixedPolygonPart {
                outer: line(&[(0, 0), (outer_size, 0), (outer_size, outer_size), (0, outer_size)]),
                inner: vec![line(&[(8, 8), (24, 8), (24, 24), (8, 24)])],
            }],
        });
        match simplify(&g, 4) {
            FixedGeometry::Polygon(p) => {
                assert_eq!(p.parts.len(), 1);
                assert!(p.parts[0].inner.is_empty());
            }
            other => panic!("expected polygon, got {other:?}"),
        }
    }
}
