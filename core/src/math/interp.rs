/// Linear blend between `start` and `end` at fraction `t`.
pub fn lerp(start: f64, end: f64, t: f64) -> f64 {
    start + (end - start) * t
}

/// Cubic Hermite blend with zero end tangents: `h00 * start + h01 * end`.
pub fn hermite_blend(start: f64, end: f64, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h01 = -2.0 * t3 + 3.0 * t2;
    h00 * start + h01 * end
}

pub fn nearest(start: f64, end: f64, t: f64) -> f64 {
    if t < 0.5 {
        start
    } else {
        end
    }
}
