use crate::os::OsHandle;

/// A host range is covered by at most a leading page, a run of whole pages
/// and a trailing page.
pub const MAX_FRAGMENTS_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentPosition {
    #[default]
    None,
    Leading,
    Middle,
    Trailing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapStatus {
    FragmentWithinStoredFragment,
    FragmentWithExactSizeAsStoredFragment,
    FragmentOverlappingAndBiggerThenStoredFragment,
    FragmentNotOverlappingWithAnyOther,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementsStatus {
    Success,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationFragment {
    pub position: FragmentPosition,
    pub ptr: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationRequirements {
    pub allocation_fragments: [AllocationFragment; MAX_FRAGMENTS_COUNT],
    pub required_fragments_count: usize,
    pub total_required_size: usize,
}

impl AllocationRequirements {
    #[must_use]
    pub fn fragments(&self) -> &[AllocationFragment] {
        &self.allocation_fragments[..self.required_fragments_count]
    }
}

/// A pinned, page-aligned slice of host memory tracked by the fragment manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentStorage {
    pub fragment_cpu_pointer: usize,
    pub fragment_size: usize,
    pub os_internal_storage: Option<OsHandle>,
    pub ref_count: u32,
}

impl FragmentStorage {
    #[must_use]
    pub const fn end(&self) -> usize {
        self.fragment_cpu_pointer + self.fragment_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentStorageData {
    pub cpu_ptr: usize,
    pub fragment_size: usize,
    pub os_handle: Option<OsHandle>,
    /// Pinned by the call that produced this storage.
    pub fresh_allocation: bool,
    /// The last reference is gone; the memory manager must unpin it.
    pub free_the_fragment: bool,
}

/// The fragments backing one host-pointer allocation, in address order.
///
/// Usually the leading, middle and trailing fragments of the request. A
/// middle run that contains stored fragments is split around them, so
/// there can be more.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OsHandleStorage {
    fragment_storage_data: Vec<FragmentStorageData>,
}

impl OsHandleStorage {
    #[must_use]
    pub fn fragments(&self) -> &[FragmentStorageData] {
        &self.fragment_storage_data
    }

    pub fn fragments_mut(&mut self) -> &mut [FragmentStorageData] {
        &mut self.fragment_storage_data
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragment_storage_data.len()
    }

    pub fn push(&mut self, data: FragmentStorageData) {
        self.fragment_storage_data.push(data);
    }

    /// Storage describing a single fragment, e.g. one being released.
    #[must_use]
    pub fn single(data: FragmentStorageData) -> Self {
        Self {
            fragment_storage_data: vec![data],
        }
    }
}
