//! Rectangle clipping over fixed-precision geometry.
//!
//! Points use an inclusive containment test, polylines are clipped per
//! segment (Liang–Barsky) and split into sub-lines where they re-enter the
//! rectangle, polygon rings go through Sutherland–Hodgman against each
//! boundary in turn. Anything that ends up empty collapses to
//! [`FixedGeometry::Null`].

use crate::fixed::{
    FixedBox, FixedGeometry, FixedPoint, FixedPolygon, FixedPolygonPart, FixedPolyline, FixedRing,
};

/// Clip a geometry to `rect` (inclusive on all four boundaries).
pub fn clip(geometry: &FixedGeometry, rect: &FixedBox) -> FixedGeometry {
    match geometry {
        FixedGeometry::Null => FixedGeometry::Null,
        FixedGeometry::Point(p) => {
            if rect.contains(*p) {
                FixedGeometry::Point(*p)
            } else {
                FixedGeometry::Null
            }
        }
        FixedGeometry::Polyline(polyline) => clip_polyline(polyline, rect),
        FixedGeometry::Polygon(polygon) => clip_polygon(polygon, rect),
    }
}

fn clip_polyline(polyline: &FixedPolyline, rect: &FixedBox) -> FixedGeometry {
    let mut out: Vec<Vec<FixedPoint>> = Vec::new();
    let mut current: Vec<FixedPoint> = Vec::new();

    let mut flush = |current: &mut Vec<FixedPoint>, out: &mut Vec<Vec<FixedPoint>>| {
        if current.len() >= 2 {
            out.push(std::mem::take(current));
        } else {
            current.clear();
        }
    };

    for line in &polyline.lines {
        for seg in line.windows(2) {
            match clip_segment(seg[0], seg[1], rect) {
                Some((p, q)) => {
                    // A gap means the line left the rectangle and re-entered:
                    // start a new sub-line.
                    if current.last() != Some(&p) {
                        flush(&mut current, &mut out);
                        current.push(p);
                    }
                    if q != p {
                        current.push(q);
                    }
                }
                None => flush(&mut current, &mut out),
            }
        }
        flush(&mut current, &mut out);
    }

    if out.is_empty() {
        FixedGeometry::Null
    } else {
        FixedGeometry::Polyline(FixedPolyline { lines: out })
    }
}

/// Liang–Barsky segment clip; exact rational parameters, endpoints rounded
/// to the nearest fixed unit and clamped into the rectangle.
fn clip_segment(a: FixedPoint, b: FixedPoint, rect: &FixedBox) -> Option<(FixedPoint, FixedPoint)> {
    let dx = b.x - a.x;
    let dy = b.y - a.y;

    // Parameters as fractions num/den with den > 0.
    let mut t0 = (0i128, 1i128);
    let mut t1 = (1i128, 1i128);

    let constraints = [
        (-dx, a.x - rect.min.x),
        (dx, rect.max.x - a.x),
        (-dy, a.y - rect.min.y),
        (dy, rect.max.y - a.y),
    ];

    for (p, q) in constraints {
        let (p, q) = (p as i128, q as i128);
        if p == 0 {
            if q < 0 {
                return None;
            }
            continue;
        }
        // Normalize the fraction q/p to a positive denominator.
        let r = if p > 0 { (q, p) } else { (-q, -p) };
        if p < 0 {
            // Entering: raise the lower bound.
            if frac_lt(t0, r) {
                t0 = r;
            }
        } else if frac_lt(r, t1) {
            // Leaving: lower the upper bound.
            t1 = r;
        }
        if frac_lt(t1, t0) {
            return None;
        }
    }

    let p = point_at(a, dx, dy, t0, rect);
    let q = point_at(a, dx, dy, t1, rect);
    Some((p, q))
}

/// `lhs < rhs` for fractions with positive denominators.
fn frac_lt(lhs: (i128, i128), rhs: (i128, i128)) -> bool {
    lhs.0 * rhs.1 < rhs.0 * lhs.1
}

fn point_at(a: FixedPoint, dx: i64, dy: i64, t: (i128, i128), rect: &FixedBox) -> FixedPoint {
    let (num, den) = t;
    if num == 0 {
        return a;
    }
    if num == den {
        return FixedPoint::new(a.x + dx, a.y + dy);
    }
    let x = a.x + div_round(dx as i128 * num, den);
    let y = a.y + div_round(dy as i128 * num, den);
    FixedPoint::new(
        x.clamp(rect.min.x, rect.max.x),
        y.clamp(rect.min.y, rect.max.y),
    )
}

fn div_round(n: i128, d: i128) -> i64 {
    let q = n.div_euclid(d);
    let r = n.rem_euclid(d);
    (if 2 * r >= d { q + 1 } else { q }) as i64
}

fn clip_polygon(polygon: &FixedPolygon, rect: &FixedBox) -> FixedGeometry {
    let mut parts = Vec::new();
    for part in &polygon.parts {
        let outer = clip_ring(&part.outer, rect);
        if outer.len() < 3 {
            continue;
        }
        let inner = part
            .inner
            .iter()
            .map(|ring| clip_ring(ring, rect))
            .filter(|ring| ring.len() >= 3)
            .collect();
        parts.push(FixedPolygonPart { outer, inner });
    }
    if parts.is_empty() {
        FixedGeometry::Null
    } else {
        FixedGeometry::Polygon(FixedPolygon { parts })
    }
}

enum Boundary {
    Left(i64),
    Right(i64),
    Top(i64),
    Bottom(i64),
}

impl Boundary {
    fn inside(&self, p: FixedPoint) -> bool {
        match *self {
            Boundary::Left(x) => p.x >= x,
            Boundary::Right(x) => p.x <= x,
            Boundary::Top(y) => p.y >= y,
            Boundary::Bottom(y) => p.y <= y,
        }
    }

    /// Intersection of segment `a`→`b` with this boundary line.
    fn intersect(&self, a: FixedPoint, b: FixedPoint) -> FixedPoint {
        match *self {
            Boundary::Left(x) | Boundary::Right(x) => {
                let y = interpolate(a.y, b.y, x - a.x, b.x - a.x);
                FixedPoint::new(x, y)
            }
            Boundary::Top(y) | Boundary::Bottom(y) => {
                let x = interpolate(a.x, b.x, y - a.y, b.y - a.y);
                FixedPoint::new(x, y)
            }
        }
    }
}

fn interpolate(from: i64, to: i64, num: i64, den: i64) -> i64 {
    debug_assert!(den != 0);
    let (num, den) = if den > 0 { (num, den) } else { (-num, -den) };
    from + div_round((to - from) as i128 * num as i128, den as i128)
}

/// Sutherland–Hodgman: clip one ring against all four boundaries.
fn clip_ring(ring: &FixedRing, rect: &FixedBox) -> FixedRing {
    let boundaries = [
        Boundary::Left(rect.min.x),
        Boundary::Right(rect.max.x),
        Boundary::Top(rect.min.y),
        Boundary::Bottom(rect.max.y),
    ];

    let mut current = ring.clone();
    for boundary in &boundaries {
        if current.len() < 3 {
            return Vec::new();
        }
        let mut next = Vec::with_capacity(current.len() + 4);
        let n = current.len();
        for i in 0..n {
            // Edge from the previous vertex into vertex `i`; keeps a fully
            // inside ring bit-identical (clip must be idempotent).
            let a = current[(i + n - 1) % n];
            let b = current[i];
            match (boundary.inside(a), boundary.inside(b)) {
                (true, true) => next.push(b),
                (true, false) => next.push(boundary.intersect(a, b)),
                (false, true) => {
                    next.push(boundary.intersect(a, b));
                    next.push(b);
                }
                (false, false) => {}
            }
        }
        next.dedup();
        if next.first() == next.last() && next.len() > 1 {
            next.pop();
        }
        current = next;
    }
    current
}
