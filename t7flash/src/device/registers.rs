//! T7 register map and external-flash region descriptors.
//!
//! Register addresses and permission keys are fixed properties of the
//! device family. Flash keys gate erases and writes per region; the erased
//! state of a flash word is all ones.

/// `FIRMWARE_VERSION` register (float32).
pub const FIRMWARE_VERSION: u16 = 60004;

/// `BOOTLOADER_VERSION` register (float32).
pub const BOOTLOADER_VERSION: u16 = 60006;

/// `SERIAL_NUMBER` register (u32).
pub const SERIAL_NUMBER: u16 = 60028;

/// `SYSTEM_REBOOT` request register (u32).
pub const SYSTEM_REBOOT: u16 = 61998;

/// Value written to [`SYSTEM_REBOOT`] to reboot into the firmware-upgrade
/// boot loader.
pub const REBOOT_UPGRADE_MAGIC: u32 = 0x4C4A_0004;

/// External-flash permission key register.
pub const EF_KEY: u16 = 61800;

/// External-flash page erase register. Writing a page-aligned address
/// erases that page, provided the matching key was written first.
pub const EF_ERASE: u16 = 61802;

/// External-flash write pointer register.
pub const EF_WRITE_POINTER: u16 = 61804;

/// External-flash write data register.
pub const EF_WRITE: u16 = 61806;

/// External-flash read pointer register.
pub const EF_READ_POINTER: u16 = 61808;

/// External-flash read data register.
pub const EF_READ: u16 = 61810;

/// Smallest erasable flash unit, in bytes.
pub const FLASH_PAGE_SIZE: u32 = 4096;

/// Value of an erased 32-bit flash word.
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// A key-protected region of external flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    /// Human-readable region name.
    pub name: &'static str,
    /// Base address in flash address space.
    pub base: u32,
    /// Number of erasable pages.
    pub pages: u32,
    /// Permission key authorizing erases and writes.
    pub key: u32,
}

impl FlashRegion {
    /// Region length in bytes.
    pub const fn len_bytes(&self) -> u32 {
        self.pages * FLASH_PAGE_SIZE
    }

    /// Region length in 32-bit words.
    pub const fn len_words(&self) -> usize {
        (self.len_bytes() / 4) as usize
    }

    /// Address of the given page.
    pub const fn page_address(&self, page: u32) -> u32 {
        self.base + page * FLASH_PAGE_SIZE
    }
}

/// Firmware image region.
pub const IMAGE_REGION: FlashRegion = FlashRegion {
    name: "image",
    base: 0x0010_0000,
    pages: 121,
    key: 0x6A0E_AD5A,
};

/// Image-info (header) region, one page directly below the image region.
pub const IMAGE_INFO_REGION: FlashRegion = FlashRegion {
    name: "image-info",
    base: 0x000F_F000,
    pages: 1,
    key: 0xF1D8_3C25,
};
