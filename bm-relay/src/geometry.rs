//! Room-space geometry: points, poses, boxes and the interest range.
//!
//! Clients send geometry as loose JSON (arrays or `{position, orientation}`
//! objects); the parsers here accept both and ignore trailing fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 2D position in room (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec2) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Parse `[x, y, …]` or `{"position": [x, y], …}`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => {
                let x = items.first()?.as_f64()?;
                let y = items.get(1)?.as_f64()?;
                Some(Self::new(x, y))
            }
            Value::Object(map) => Self::from_json(map.get("position")?),
            _ => None,
        }
    }
}

/// Position plus heading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub position: Vec2,
    pub orientation: f64,
}

impl Pose {
    /// Parse `[x, y, orientation?]` or `{"position": [x, y], "orientation": o}`.
    pub fn from_json(value: &Value) -> Option<Self> {
        let position = Vec2::from_json(value)?;
        let orientation = match value {
            Value::Array(items) => items.get(2).and_then(Value::as_f64),
            Value::Object(map) => map.get("orientation").and_then(Value::as_f64),
            _ => None,
        }
        .unwrap_or(0.0);
        Some(Self {
            position,
            orientation,
        })
    }

    /// Parse a serialized pose string (the `v` of a pose message).
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|v| Self::from_json(&v))
    }
}

/// Axis-aligned bounding box stored as min/max corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Aabb {
    /// Create from origin + size. A negative size extends left/up from the origin.
    pub fn from_rect(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::from_corners(x, y, x + width, y + height)
    }

    /// Create from `[left, top, right, bottom]`, normalising swapped corners.
    pub fn from_corners(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            min_x: left.min(right),
            min_y: top.min(bottom),
            max_x: left.max(right),
            max_y: top.max(bottom),
        }
    }

    /// Point-in-box test, edges inclusive.
    pub fn contains(&self, p: &Vec2) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    /// Box overlap test, touching edges count.
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Closest point of the box to `p`.
    pub fn clamp(&self, p: &Vec2) -> Vec2 {
        // Not `f64::clamp`: it panics on an inverted box.
        Vec2::new(
            p.x.max(self.min_x).min(self.max_x),
            p.y.max(self.min_y).min(self.max_y),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub center: Vec2,
    pub radius: f64,
}

impl Circle {
    pub fn contains(&self, p: &Vec2) -> bool {
        self.center.distance(p) <= self.radius
    }

    pub fn intersects(&self, aabb: &Aabb) -> bool {
        self.contains(&aabb.clamp(&self.center))
    }
}

/// A participant's interest area: visible rectangle and audible circle.
///
/// An entity is in range when it passes either filter. A missing filter
/// never matches.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InterestRange {
    pub visible: Option<Aabb>,
    pub audible: Option<Circle>,
}

impl InterestRange {
    /// Parse `[[left, top, right, bottom], [cx, cy, radius]]`.
    ///
    /// Either element may be empty or absent.
    pub fn from_json(value: &Value) -> Option<Self> {
        let parts = value.as_array()?;
        let numbers = |v: Option<&Value>| -> Vec<f64> {
            v.and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_f64).collect())
                .unwrap_or_default()
        };

        let rect = numbers(parts.first());
        let visible = (rect.len() >= 4).then(|| Aabb::from_corners(rect[0], rect[1], rect[2], rect[3]));

        let circle = numbers(parts.get(1));
        let audible = (circle.len() >= 3).then(|| Circle {
            center: Vec2::new(circle[0], circle[1]),
            radius: circle[2],
        });

        Some(Self { visible, audible })
    }

    pub fn contains_point(&self, p: &Vec2) -> bool {
        self.visible.is_some_and(|r| r.contains(p)) || self.audible.is_some_and(|c| c.contains(p))
    }

    pub fn overlaps(&self, aabb: &Aabb) -> bool {
        self.visible.is_some_and(|r| r.intersects(aabb))
            || self.audible.is_some_and(|c| c.intersects(aabb))
    }
}
