use bitflags::bitflags;

bitflags! {
    /// Open modes, shared with user programs.
    pub struct FcntlFlags: i32 {
        const O_RDONLY = 0x000;
        const O_WRONLY = 0x001;
        const O_RDWR = 0x002;
        const O_CREATE = 0x200;
    }
}
