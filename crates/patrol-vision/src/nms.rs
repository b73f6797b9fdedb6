use patrol_proto::BoundingBox;

fn corners(b: &BoundingBox) -> (f32, f32, f32, f32) {
    (b.cx - b.w / 2.0, b.cy - b.h / 2.0, b.cx + b.w / 2.0, b.cy + b.h / 2.0)
}

pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let (x1a, y1a, x1b, y1b) = corners(a);
    let (x2a, y2a, x2b, y2b) = corners(b);

    let iw = (x1b.min(x2b) - x1a.max(x2a)).max(0.0);
    let ih = (y1b.min(y2b) - y1a.max(y2a)).max(0.0);
    let inter = iw * ih;
    let a1 = (x1b - x1a).max(0.0) * (y1b - y1a).max(0.0);
    let a2 = (x2b - x2a).max(0.0) * (y2b - y2a).max(0.0);
    let union = a1 + a2 - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Centre distance, in units of the frame's short side (1.0 for normalized boxes).
pub fn center_distance(a: &BoundingBox, b: &BoundingBox) -> f32 {
    ((a.cx - b.cx).powi(2) + (a.cy - b.cy).powi(2)).sqrt()
}
