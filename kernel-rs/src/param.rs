use cfg_if::cfg_if;

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size.
pub const BSIZE: usize = 512;

/// Max # of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

cfg_if! {
    if #[cfg(feature = "big-disk")] {
        /// Size of file system in blocks; the contract with mkfs.
        #[allow(dead_code)]
        pub const FSSIZE: u32 = 20000;
    } else {
        /// Size of file system in blocks; the contract with mkfs.
        #[allow(dead_code)]
        pub const FSSIZE: u32 = 1000;
    }
}

/// Size of per-process kernel stack.
pub const KSTACKSIZE: usize = 4096;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;
