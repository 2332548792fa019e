//! The eight rotations and mirrors of a rectangle.
//!
//! `forward` maps a canonical coordinate into the oriented buffer; `inverse`
//! maps an oriented coordinate back. Both take the canonical extent `(w, h)`.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Orientation {
    Identity,
    Rot90,
    Rot180,
    Rot270,
    Mirror,
    MirrorRot90,
    MirrorRot180,
    MirrorRot270,
}

impl Orientation {
    pub const COUNT: usize = 8;

    /// Canonical accumulation order: the identity, three clockwise
    /// rotations, then the horizontal mirror followed by the same rotations.
    pub const ALL: [Orientation; Self::COUNT] = [
        Self::Identity,
        Self::Rot90,
        Self::Rot180,
        Self::Rot270,
        Self::Mirror,
        Self::MirrorRot90,
        Self::MirrorRot180,
        Self::MirrorRot270,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn swaps_axes(self) -> bool {
        matches!(
            self,
            Self::Rot90 | Self::Rot270 | Self::MirrorRot90 | Self::MirrorRot270
        )
    }

    /// Extent of the oriented buffer.
    pub const fn dims(self, w: usize, h: usize) -> (usize, usize) {
        if self.swaps_axes() {
            (h, w)
        } else {
            (w, h)
        }
    }

    pub const fn forward(self, x: usize, y: usize, w: usize, h: usize) -> (usize, usize) {
        match self {
            Self::Identity => (x, y),
            Self::Rot90 => (h - 1 - y, x),
            Self::Rot180 => (w - 1 - x, h - 1 - y),
            Self::Rot270 => (y, w - 1 - x),
            Self::Mirror => (w - 1 - x, y),
            Self::MirrorRot90 => (h - 1 - y, w - 1 - x),
            Self::MirrorRot180 => (x, h - 1 - y),
            Self::MirrorRot270 => (y, x),
        }
    }

    pub const fn inverse(self, x: usize, y: usize, w: usize, h: usize) -> (usize, usize) {
        match self {
            Self::Identity => (x, y),
            Self::Rot90 => (y, h - 1 - x),
            Self::Rot180 => (w - 1 - x, h - 1 - y),
            Self::Rot270 => (w - 1 - y, x),
            Self::Mirror => (w - 1 - x, y),
            Self::MirrorRot90 => (w - 1 - y, h - 1 - x),
            Self::MirrorRot180 => (x, h - 1 - y),
            Self::MirrorRot270 => (y, x),
        }
    }
}
