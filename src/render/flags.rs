//! Dirty flags for render proxies
//!
//! Tracks which parts of a proxy's display state differ from what viewers
//! last received, so only those metadata fields are re-sent.

use bitflags::bitflags;

bitflags! {
    /// Flags indicating what proxy data needs to be synchronized
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProxyFlags: u8 {
        /// No updates needed
        const NONE = 0;
        /// Translation, rotation or scale changed
        const TRANSFORM = 1 << 0;
        /// Displayed item changed (swap, tint, skin or visibility)
        const ITEM = 1 << 1;
        /// Glow toggled or recoloured
        const GLOW = 1 << 2;
        /// Brightness override changed
        const BRIGHTNESS = 1 << 3;
        /// Interpolation timing changed
        const INTERPOLATION = 1 << 4;
    }
}

impl Default for ProxyFlags {
    fn default() -> Self {
        Self::NONE
    }
}

impl ProxyFlags {
    /// Everything a freshly spawned proxy must carry
    pub const SPAWN: ProxyFlags = ProxyFlags::all();

    /// Check if any updates are flagged
    pub fn has_update(&self) -> bool {
        !self.is_empty()
    }

    /// Check if transform update is needed
    pub fn needs_transform(&self) -> bool {
        self.contains(Self::TRANSFORM)
    }

    /// Check if item update is needed
    pub fn needs_item(&self) -> bool {
        self.contains(Self::ITEM)
    }

    /// Check if glow update is needed
    pub fn needs_glow(&self) -> bool {
        self.contains(Self::GLOW)
    }

    /// Check if brightness update is needed
    pub fn needs_brightness(&self) -> bool {
        self.contains(Self::BRIGHTNESS)
    }

    /// Check if interpolation update is needed
    pub fn needs_interpolation(&self) -> bool {
        self.contains(Self::INTERPOLATION)
    }

    /// Clear all flags
    pub fn clear(&mut self) {
        *self = Self::NONE;
    }
}
