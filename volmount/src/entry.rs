//! Declarative mount entries describing a compartment root filesystem.

/// How one entry is sourced and mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    /// Read-only image shared from the guest OS directory.
    Shared,
    /// Shared image with a tmpfs overlay on top.
    SharedRw,
    /// Read-only copy of a raw block device.
    Device,
    /// Writable copy of a raw block device.
    DeviceRw,
    /// Fresh sparse image, formatted on first mount.
    Empty,
    /// Per-compartment copy of a guest OS image.
    Copy,
    /// Image mounted by firmware; skipped here.
    Flash,
    /// Read-only overlay upper image.
    OverlayRo,
    /// Writable overlay upper image.
    OverlayRw,
    /// Read-only bind of a file from the shared store.
    BindFile,
    /// Writable bind of a file from the shared store.
    BindFileRw,
    /// Read-only bind of a host directory.
    BindDir,
    /// Writable bind of a host directory.
    BindDirRw,
}

impl MountType {
    /// Entries mounted via overlayfs composition.
    pub fn is_overlay(self) -> bool {
        matches!(self, Self::OverlayRo | Self::OverlayRw | Self::SharedRw)
    }

    /// Entries that bind host files or directories instead of images.
    pub fn is_bind(self) -> bool {
        matches!(self, Self::BindFile | Self::BindFileRw | Self::BindDir | Self::BindDirRw)
    }

    /// Entries whose image lives in the guest OS directory.
    pub fn uses_guestos_image(self) -> bool {
        matches!(self, Self::Shared | Self::SharedRw | Self::Flash | Self::OverlayRo)
    }

    /// Entries whose image lives in the compartment images directory.
    pub fn uses_compartment_image(self) -> bool {
        matches!(
            self,
            Self::Device | Self::DeviceRw | Self::Empty | Self::Copy | Self::OverlayRw
        )
    }

    /// Entries mounted read-only (before any overlay is considered).
    pub fn is_readonly(self) -> bool {
        matches!(self, Self::Shared | Self::Device | Self::OverlayRo | Self::BindFile | Self::BindDir)
    }

    /// Entries whose mounts are registered for id-shifting in a
    /// user-namespaced compartment.
    pub fn shifts_ids(self) -> bool {
        matches!(
            self,
            Self::Shared
                | Self::SharedRw
                | Self::OverlayRw
                | Self::DeviceRw
                | Self::Empty
                | Self::Copy
                | Self::BindDir
                | Self::BindDirRw
        )
    }
}

/// One declarative mount. Immutable once the compartment starts.
#[derive(Debug, Clone)]
pub struct MountEntry {
    mount_type: MountType,
    /// Image name, device path or bind source, depending on the type.
    img: String,
    /// Target directory relative to the compartment root.
    dir: String,
    fs: String,
    mount_data: Option<String>,
    /// Image size in MiB for entries that are created on demand.
    size_mb: u64,
    /// Root hash enabling dm-verity protection for this entry.
    verity_root_hash: Option<String>,
    /// Expected whole-image digest for non-verity verification.
    img_sha256: Option<String>,
    encrypted: bool,
}

impl MountEntry {
    pub fn new(
        mount_type: MountType,
        img: impl Into<String>,
        dir: impl Into<String>,
        fs: impl Into<String>,
    ) -> Self {
        MountEntry {
            mount_type,
            img: img.into(),
            dir: dir.into(),
            fs: fs.into(),
            mount_data: None,
            size_mb: 0,
            verity_root_hash: None,
            img_sha256: None,
            encrypted: false,
        }
    }

    pub fn with_size(mut self, size_mb: u64) -> Self {
        self.size_mb = size_mb;
        self
    }

    pub fn with_mount_data(mut self, data: impl Into<String>) -> Self {
        self.mount_data = Some(data.into());
        self
    }

    pub fn with_verity_hash(mut self, root_hash_hex: impl Into<String>) -> Self {
        self.verity_root_hash = Some(root_hash_hex.into());
        self
    }

    pub fn with_sha256(mut self, digest_hex: impl Into<String>) -> Self {
        self.img_sha256 = Some(digest_hex.into());
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn mount_type(&self) -> MountType {
        self.mount_type
    }

    pub fn img(&self) -> &str {
        &self.img
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn fs(&self) -> &str {
        &self.fs
    }

    pub fn mount_data(&self) -> Option<&str> {
        self.mount_data.as_deref()
    }

    pub fn size_mb(&self) -> u64 {
        self.size_mb
    }

    pub fn verity_root_hash(&self) -> Option<&str> {
        self.verity_root_hash.as_deref()
    }

    pub fn img_sha256(&self) -> Option<&str> {
        self.img_sha256.as_deref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Mounted at the compartment root itself.
    pub fn is_root(&self) -> bool {
        self.dir == "/"
    }
}

/// Ordered list of mounts for one compartment; setup walks it front to
/// back, teardown back to front.
#[derive(Debug, Default, Clone)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: MountEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MountEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readonly_types() {
        assert!(MountType::Shared.is_readonly());
        assert!(MountType::Device.is_readonly());
        assert!(MountType::OverlayRo.is_readonly());
        assert!(MountType::BindFile.is_readonly());
        assert!(MountType::BindDir.is_readonly());

        assert!(!MountType::SharedRw.is_readonly());
        assert!(!MountType::Empty.is_readonly());
        assert!(!MountType::BindFileRw.is_readonly());
        assert!(!MountType::BindDirRw.is_readonly());
    }

    #[test]
    fn overlay_types() {
        assert!(MountType::OverlayRo.is_overlay());
        assert!(MountType::OverlayRw.is_overlay());
        assert!(MountType::SharedRw.is_overlay());
        assert!(!MountType::Shared.is_overlay());
        assert!(!MountType::Empty.is_overlay());
    }

    #[test]
    fn image_source_partition() {
        // every image-backed type resolves to exactly one directory
        for ty in [
            MountType::Shared,
            MountType::SharedRw,
            MountType::Device,
            MountType::DeviceRw,
            MountType::Empty,
            MountType::Copy,
            MountType::Flash,
            MountType::OverlayRo,
            MountType::OverlayRw,
        ] {
            assert!(
                ty.uses_guestos_image() ^ ty.uses_compartment_image(),
                "{ty:?} must come from exactly one image directory"
            );
        }
        for ty in [
            MountType::BindFile,
            MountType::BindFileRw,
            MountType::BindDir,
            MountType::BindDirRw,
        ] {
            assert!(!ty.uses_guestos_image() && !ty.uses_compartment_image());
            assert!(ty.is_bind());
        }
    }

    #[test]
    fn entry_builder_round_trip() {
        let e = MountEntry::new(MountType::Empty, "data", "/data", "ext4")
            .with_size(128)
            .with_mount_data("noatime")
            .encrypted(true);
        assert_eq!(e.mount_type(), MountType::Empty);
        assert_eq!(e.img(), "data");
        assert_eq!(e.dir(), "/data");
        assert_eq!(e.fs(), "ext4");
        assert_eq!(e.size_mb(), 128);
        assert_eq!(e.mount_data(), Some("noatime"));
        assert!(e.is_encrypted());
        assert!(!e.is_root());
    }

    #[test]
    fn root_entry_detection() {
        assert!(MountEntry::new(MountType::Shared, "root", "/", "squashfs").is_root());
    }

    #[test]
    fn table_preserves_order() {
        let mut t = MountTable::new();
        t.add(MountEntry::new(MountType::Shared, "a", "/", "ext4"));
        t.add(MountEntry::new(MountType::Empty, "b", "/data", "ext4"));
        let names: Vec<_> = t.iter().map(|e| e.img()).collect();
        assert_eq!(names, ["a", "b"]);
        let reversed: Vec<_> = t.iter().rev().map(|e| e.img()).collect();
        assert_eq!(reversed, ["b", "a"]);
    }
}
