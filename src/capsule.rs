#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapsuleError {
    RangeViolation { owner: String, active: String },
    OutOfCapacity { requested: usize, available: usize },
    IndexOutOfBounds { index: usize, len: usize },
}

impl core::fmt::Display for CapsuleError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CapsuleError::RangeViolation { owner, active } => write!(
                f,
                "capsule range violation: access from '{}' but owned by '{}'",
                active, owner
            ),
            CapsuleError::OutOfCapacity {
                requested,
                available,
            } => write!(
                f,
                "capsule arena exhausted: requested {} cells, {} available",
                requested, available
            ),
            CapsuleError::IndexOutOfBounds { index, len } => {
                write!(f, "capsule index {} out of bounds (len {})", index, len)
            }
        }
    }
}

impl std::error::Error for CapsuleError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeContext {
    current: String,
    stack: Vec<String>,
}

impl RangeContext {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            current: root.into(),
            stack: Vec::new(),
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn enter(&mut self, range: impl Into<String>) {
        self.stack.push(std::mem::replace(&mut self.current, range.into()));
    }

    pub fn leave(&mut self) {
        if let Some(prev) = self.stack.pop() {
            self.current = prev;
        }
    }
}

// bump allocator bound to one range; reset recycles the whole arena, nothing
// is freed individually. The language surface never allocates capsules, the
// runtime protocol shape is exercised by tests.
#[derive(Debug, Clone)]
pub struct CapsuleArena {
    cells: Vec<i64>,
    used: usize,
    range: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleHandle {
    start: usize,
    len: usize,
    range: String,
}

impl CapsuleHandle {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl CapsuleArena {
    pub fn new(capacity: usize, range: impl Into<String>) -> Self {
        Self {
            cells: vec![0; capacity],
            used: 0,
            range: range.into(),
        }
    }

    pub fn range(&self) -> &str {
        &self.range
    }

    pub fn alloc(&mut self, count: usize) -> Result<CapsuleHandle, CapsuleError> {
        let available = self.cells.len() - self.used;
        if count > available {
            return Err(CapsuleError::OutOfCapacity {
                requested: count,
                available,
            });
        }
        let start = self.used;
        self.used += count;
        Ok(CapsuleHandle {
            start,
            len: count,
            range: self.range.clone(),
        })
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn get(
        &self,
        ctx: &RangeContext,
        handle: &CapsuleHandle,
        index: usize,
    ) -> Result<i64, CapsuleError> {
        self.guard(ctx, handle, index)?;
        Ok(self.cells[handle.start + index])
    }

    pub fn set(
        &mut self,
        ctx: &RangeContext,
        handle: &CapsuleHandle,
        index: usize,
        value: i64,
    ) -> Result<(), CapsuleError> {
        self.guard(ctx, handle, index)?;
        self.cells[handle.start + index] = value;
        Ok(())
    }

    fn guard(
        &self,
        ctx: &RangeContext,
        handle: &CapsuleHandle,
        index: usize,
    ) -> Result<(), CapsuleError> {
        if handle.range != ctx.current() {
            return Err(CapsuleError::RangeViolation {
                owner: handle.range.clone(),
                active: ctx.current().to_string(),
            });
        }
        if index >= handle.len {
            return Err(CapsuleError::IndexOutOfBounds {
                index,
                len: handle.len,
            });
        }
        Ok(())
    }
}
