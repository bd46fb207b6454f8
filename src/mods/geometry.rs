use std::{
    fmt,
    ops::{Add, AddAssign, Mul, Neg, Sub},
};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    #[inline(always)]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[inline(always)]
    pub fn dot(&self, other: &Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[inline(always)]
    pub fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    #[inline(always)]
    pub fn length_sq(&self) -> f64 {
        self.dot(self)
    }

    #[inline(always)]
    pub fn length(&self) -> f64 {
        self.length_sq().sqrt()
    }

    /// Returns `None` for vectors shorter than `zero`.
    pub fn normalized(&self, zero: f64) -> Option<Vec3> {
        let len = self.length();
        (len > zero).then(|| *self * (1.0 / len))
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    #[inline(always)]
    fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }
}

impl AddAssign for Vec3 {
    #[inline(always)]
    fn add_assign(&mut self, o: Vec3) {
        self.x += o.x;
        self.y += o.y;
        self.z += o.z;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    #[inline(always)]
    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;
    #[inline(always)]
    fn mul(self, k: f64) -> Vec3 {
        Vec3::new(self.x * k, self.y * k, self.z * k)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;
    #[inline(always)]
    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5}, {:.5})", self.x, self.y, self.z)
    }
}

/// Unit-cell translation plus the index of the atom inside the cell.
///
/// Used both as an absolute position and as a position relative to a jump
/// start. `a - b` gives the cell difference and keeps the stack of `a`;
/// `a + r` shifts `a` by the cell part of `r` and lands on the stack of `r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LatticePos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub s: usize,
}

impl LatticePos {
    #[inline(always)]
    pub const fn new(x: i32, y: i32, z: i32, s: usize) -> Self {
        Self { x, y, z, s }
    }

    #[inline(always)]
    pub const fn origin(s: usize) -> Self {
        Self::new(0, 0, 0, s)
    }

    /// Same cell offset pointing the other way, landing on stack `s`.
    #[inline(always)]
    pub const fn reversed(&self, s: usize) -> Self {
        Self::new(-self.x, -self.y, -self.z, s)
    }
}

impl Add for LatticePos {
    type Output = LatticePos;
    #[inline(always)]
    fn add(self, rel: LatticePos) -> LatticePos {
        LatticePos::new(self.x + rel.x, self.y + rel.y, self.z + rel.z, rel.s)
    }
}

impl Sub for LatticePos {
    type Output = LatticePos;
    #[inline(always)]
    fn sub(self, o: LatticePos) -> LatticePos {
        LatticePos::new(self.x - o.x, self.y - o.y, self.z - o.z, self.s)
    }
}

impl fmt::Display for LatticePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {} | {}]", self.x, self.y, self.z, self.s)
    }
}

/// Position in jump-local cylindrical coordinates, azimuth in degrees `[0, 360)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CylCoord {
    pub axial: f64,
    pub radial: f64,
    pub azimuth: f64,
}

/// Orthonormal frame around a jump axis. The azimuth reference is fixed lazily
/// by the first point that lies off the axis.
#[derive(Debug, Clone, Copy)]
pub struct AxisFrame {
    origin: Vec3,
    axis: Vec3,
    reference: Option<(Vec3, Vec3)>,
    zero: f64,
}

impl AxisFrame {
    /// `axis_to` defines the positive axial direction seen from `origin`.
    pub fn new(origin: Vec3, axis_to: Vec3, zero: f64) -> Option<Self> {
        let axis = (axis_to - origin).normalized(zero)?;
        Some(Self {
            origin,
            axis,
            reference: None,
            zero,
        })
    }

    pub fn to_cylindrical(&mut self, point: Vec3) -> CylCoord {
        let rel = point - self.origin;
        let axial = rel.dot(&self.axis);
        let perp = rel - self.axis * axial;
        let radial = perp.length();

        if radial <= self.zero {
            return CylCoord {
                axial,
                radial: 0.0,
                azimuth: 0.0,
            };
        }

        let (e1, e2) = match self.reference {
            Some(frame) => frame,
            None => {
                let e1 = perp * (1.0 / radial);
                let e2 = self.axis.cross(&e1);
                self.reference = Some((e1, e2));
                (e1, e2)
            }
        };

        let azimuth = perp.dot(&e2).atan2(perp.dot(&e1)).to_degrees();
        CylCoord {
            axial,
            radial,
            azimuth: wrap_degrees(azimuth),
        }
    }
}

#[inline(always)]
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_arithmetic_is_translation_invariant() {
        let a = LatticePos::new(2, -1, 4, 1);
        let b = LatticePos::new(1, 1, 1, 0);
        let rel = a - b;
        assert_eq!(rel, LatticePos::new(1, -2, 3, 1));
        assert_eq!(b + rel, a);

        let shift = LatticePos::new(5, 5, 5, 0);
        assert_eq!((a + LatticePos::new(5, 5, 5, a.s)) - (b + shift), rel);
    }

    #[test]
    fn first_off_axis_point_defines_zero_azimuth() {
        let mut frame =
            AxisFrame::new(Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0), 1e-6).expect("axis");
        let on_axis = frame.to_cylindrical(Vec3::new(0.0, 0.0, 2.0));
        assert_eq!(on_axis.radial, 0.0);

        let first = frame.to_cylindrical(Vec3::new(0.0, 1.0, 0.5));
        assert!((first.azimuth - 0.0).abs() < 1e-9);
        assert!((first.radial - 1.0).abs() < 1e-12);
        assert!((first.axial - 0.5).abs() < 1e-12);

        let quarter = frame.to_cylindrical(Vec3::new(-1.0, 0.0, 0.0));
        assert!((quarter.azimuth - 90.0).abs() < 1e-9);

        let opposite = frame.to_cylindrical(Vec3::new(0.0, -2.0, 0.0));
        assert!((opposite.azimuth - 180.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_axis_is_rejected() {
        assert!(AxisFrame::new(Vec3::ZERO, Vec3::ZERO, 1e-6).is_none());
    }

    #[test]
    fn wrap_degrees_stays_in_range() {
        assert_eq!(wrap_degrees(-90.0), 270.0);
        assert_eq!(wrap_degrees(720.0), 0.0);
        assert!(wrap_degrees(-1e-18) < 360.0);
    }
}
