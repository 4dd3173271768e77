use super::address;
use bitvec::BitArr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Control (header) bytes of an outgoing read packet.
pub const READ_PACKET_SIZE: u8 = 8;

/// Control bytes of an outgoing write packet: 6 address, 2 miscellaneous.
pub const WRITE_PACKET_SIZE: u8 = 8;

/// Largest access a single warp instruction can generate, in bytes.
pub const MAX_MEMORY_ACCESS_SIZE: usize = 128;

/// Number of threads per warp.
pub const WARP_SIZE: usize = 32;

pub type ByteMask = BitArr!(for MAX_MEMORY_ACCESS_SIZE);
pub type WarpMask = BitArr!(for WARP_SIZE);

/// Where a request currently sits in the memory system.
///
/// Only the stations the cache model itself moves requests through are
/// tracked here; the host simulator owns the rest of the request's journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Status {
    INITIALIZED,
    IN_L1D_MISS_QUEUE,
    IN_L1C_MISS_QUEUE,
    IN_L2_MISS_QUEUE,
    IN_ICNT_TO_MEM,
}

#[derive(
    Debug,
    strum::EnumIter,
    strum::EnumCount,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum AccessKind {
    GLOBAL_ACC_R,
    LOCAL_ACC_R,
    CONST_ACC_R,
    TEXTURE_ACC_R,
    GLOBAL_ACC_W,
    LOCAL_ACC_W,
    L1_WRBK_ACC,
    L2_WRBK_ACC,
    INST_ACC_R,
    L1_WR_ALLOC_R,
    L2_WR_ALLOC_R,
}

impl AccessKind {
    #[must_use]
    pub fn is_write(&self) -> bool {
        match self {
            AccessKind::GLOBAL_ACC_R
            | AccessKind::LOCAL_ACC_R
            | AccessKind::CONST_ACC_R
            | AccessKind::TEXTURE_ACC_R
            | AccessKind::INST_ACC_R
            | AccessKind::L1_WR_ALLOC_R
            | AccessKind::L2_WR_ALLOC_R => false,
            AccessKind::GLOBAL_ACC_W
            | AccessKind::LOCAL_ACC_W
            | AccessKind::L1_WRBK_ACC
            | AccessKind::L2_WRBK_ACC => true,
        }
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        matches!(self, AccessKind::GLOBAL_ACC_R | AccessKind::GLOBAL_ACC_W)
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, AccessKind::LOCAL_ACC_R | AccessKind::LOCAL_ACC_W)
    }
}

/// A single memory access as issued by a warp instruction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MemAccess {
    /// Requested address.
    pub addr: address,
    /// Access kind.
    pub kind: AccessKind,
    /// Requested number of bytes.
    pub req_size_bytes: u32,
    pub is_write: bool,
    /// Active mask of the issuing warp.
    pub warp_active_mask: WarpMask,
    /// Per-byte write mask within the access.
    pub byte_mask: ByteMask,
}

impl std::fmt::Debug for MemAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemAccess")
            .field("addr", &self.addr)
            .field("kind", &self.kind)
            .field("req_size_bytes", &self.req_size_bytes)
            .field("is_write", &self.is_write)
            .finish()
    }
}

impl std::fmt::Display for MemAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}@{}", self.kind, self.addr)
    }
}

pub mod access {
    /// Builds a [`MemAccess`](super::MemAccess).
    #[derive(Debug, Clone)]
    pub struct Builder {
        pub kind: super::AccessKind,
        pub addr: crate::address,
        pub req_size_bytes: u32,
        pub is_write: bool,
        pub warp_active_mask: super::WarpMask,
        pub byte_mask: super::ByteMask,
    }

    impl Builder {
        #[must_use]
        pub fn build(self) -> super::MemAccess {
            assert_eq!(
                self.kind.is_write(),
                self.is_write,
                "access kind and write flag disagree"
            );
            super::MemAccess {
                addr: self.addr,
                kind: self.kind,
                req_size_bytes: self.req_size_bytes,
                is_write: self.is_write,
                warp_active_mask: self.warp_active_mask,
                byte_mask: self.byte_mask,
            }
        }
    }
}

impl MemAccess {
    #[must_use]
    pub fn control_size(&self) -> u32 {
        if self.is_write {
            u32::from(WRITE_PACKET_SIZE)
        } else {
            u32::from(READ_PACKET_SIZE)
        }
    }

    #[must_use]
    pub fn data_size(&self) -> u32 {
        self.req_size_bytes
    }
}

static NEXT_UID: AtomicU64 = AtomicU64::new(0);

/// A request travelling through the memory hierarchy.
///
/// The `uid` is stable for the lifetime of the request and survives cloning,
/// so side tables can key on it even after the address or data size has been
/// rewritten for the downstream trip.
#[derive(Clone)]
pub struct MemFetch {
    pub uid: u64,
    pub access: MemAccess,
    /// Warp that issued the access (rewritten for prefetch carriers).
    pub warp_id: usize,
    /// Cooperative thread array the warp belongs to.
    pub cta_id: usize,
    /// Shader core the request originates from.
    pub core_id: usize,
    /// Program counter of the issuing load instruction.
    pub pc: address,
    /// Thread 0 of the warp is active for this access.
    ///
    /// The stride prefetcher only learns from such leader accesses.
    pub thread0_active: bool,
    pub is_atomic: bool,
    /// Set once the cache has adopted this request as a prefetch.
    pub is_prefetch: bool,
    pub status: Status,
    pub last_status_change: Option<u64>,
}

impl std::fmt::Debug for MemFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemFetch")
            .field("uid", &self.uid)
            .field("access", &self.access)
            .field("warp_id", &self.warp_id)
            .field("cta_id", &self.cta_id)
            .field("is_prefetch", &self.is_prefetch)
            .field("status", &self.status)
            .finish()
    }
}

impl std::fmt::Display for MemFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}(w{})", self.access, self.warp_id)
    }
}

/// Builds a [`MemFetch`], assigning it a fresh uid.
#[derive(Debug, Clone)]
pub struct Builder {
    pub access: MemAccess,
    pub warp_id: usize,
    pub cta_id: usize,
    pub core_id: usize,
    pub pc: address,
    pub thread0_active: bool,
    pub is_atomic: bool,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> MemFetch {
        MemFetch {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            access: self.access,
            warp_id: self.warp_id,
            cta_id: self.cta_id,
            core_id: self.core_id,
            pc: self.pc,
            thread0_active: self.thread0_active,
            is_atomic: self.is_atomic,
            is_prefetch: false,
            status: Status::INITIALIZED,
            last_status_change: None,
        }
    }
}

impl MemFetch {
    #[must_use]
    pub fn addr(&self) -> address {
        self.access.addr
    }

    pub fn set_addr(&mut self, addr: address) {
        self.access.addr = addr;
    }

    #[must_use]
    pub fn access_kind(&self) -> AccessKind {
        self.access.kind
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.access.is_write
    }

    #[must_use]
    pub fn is_atomic(&self) -> bool {
        self.is_atomic
    }

    #[must_use]
    pub fn data_size(&self) -> u32 {
        self.access.req_size_bytes
    }

    pub fn set_data_size(&mut self, size: u32) {
        self.access.req_size_bytes = size;
    }

    #[must_use]
    pub fn control_size(&self) -> u32 {
        self.access.control_size()
    }

    /// Total packet size on the interconnect, in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.data_size() + self.control_size()
    }

    pub fn set_status(&mut self, status: Status, time: u64) {
        self.status = status;
        self.last_status_change = Some(time);
    }
}
