use std::path::PathBuf;

/// What to do when a row checksum fails to verify.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CorruptPolicy {
    /// Terminate the process to prevent data divergence.
    Abort,
    /// Return a typed corruption error to the caller.
    #[default]
    Error,
}

/// Number of free-space buckets for variable-sized pages. Bucket index
/// `BUCKET_COUNT` is the overflow "do not allocate here" bucket.
pub const BUCKET_COUNT: usize = 4;

/// Engine construction options.
///
/// The policy knobs here are fed in at startup and carried as explicit
/// context values on the engine; nothing in the crate reads process-wide
/// state.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub(crate) pool_bytes: usize,
    pub(crate) backing_file: Option<PathBuf>,
    pub(crate) corrupt_policy: CorruptPolicy,
    pub(crate) max_interp_instructions: u32,
    pub(crate) op_retry_count: u8,
    pub(crate) var_bucket_bounds: [u16; BUCKET_COUNT],
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pool_bytes: 64 << 20,
            backing_file: None,
            corrupt_policy: CorruptPolicy::default(),
            max_interp_instructions: 16_000,
            op_retry_count: 3,
            // Minimum contiguous free words a page must hold to sit in
            // bucket 0..3. These are tunables, not format.
            var_bucket_bounds: [1024, 256, 64, 0],
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page pool size in bytes. Rounded up to a whole number of
    /// page frames.
    pub fn pool_bytes(&mut self, bytes: usize) -> &mut Self {
        self.pool_bytes = bytes;
        self
    }

    /// Back the page pool with a file instead of an anonymous map. The file
    /// is locked for exclusive use while the engine is open.
    pub fn backing_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.backing_file = Some(path.into());
        self
    }

    /// Select the checksum-on-corrupt policy.
    pub fn corrupt_policy(&mut self, policy: CorruptPolicy) -> &mut Self {
        self.corrupt_policy = policy;
        self
    }

    /// Cap on interpreter instructions executed per operation.
    pub fn max_interp_instructions(&mut self, max: u32) -> &mut Self {
        self.max_interp_instructions = max;
        self
    }

    /// How many times a parked operation is rescheduled before giving up.
    pub fn op_retry_count(&mut self, retries: u8) -> &mut Self {
        self.op_retry_count = retries;
        self
    }

    /// Free-space bucket thresholds for variable pages, in words,
    /// descending. A page sits in the first bucket whose bound its
    /// contiguous free space meets.
    pub fn var_bucket_bounds(&mut self, bounds: [u16; BUCKET_COUNT]) -> &mut Self {
        self.var_bucket_bounds = bounds;
        self
    }
}
