use std::fmt;

use super::{LibraryResult, Status};

/// Named input/output slot of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRole {
    Src,
    Filter,
    Bias,
    Dst,
    DiffSrc,
    DiffFilter,
    DiffBias,
    DiffDst,
    /// Conversion input.
    From,
    /// Conversion output.
    To,
}

impl ResourceRole {
    pub const COUNT: usize = 10;

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceRole::Src => "src",
            ResourceRole::Filter => "filter",
            ResourceRole::Bias => "bias",
            ResourceRole::Dst => "dst",
            ResourceRole::DiffSrc => "diff_src",
            ResourceRole::DiffFilter => "diff_filter",
            ResourceRole::DiffBias => "diff_bias",
            ResourceRole::DiffDst => "diff_dst",
            ResourceRole::From => "from",
            ResourceRole::To => "to",
        }
    }
}

impl fmt::Display for ResourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Slot<'a> {
    Empty,
    Input(&'a [f32]),
    Output(&'a mut [f32]),
}

/// Resource binding table, built fresh for every execution.
pub struct Resources<'a> {
    slots: [Slot<'a>; ResourceRole::COUNT],
}

impl<'a> Resources<'a> {
    pub fn new() -> Self {
        Resources {
            slots: std::array::from_fn(|_| Slot::Empty),
        }
    }

    pub fn bind_input(&mut self, role: ResourceRole, data: &'a [f32]) -> &mut Self {
        self.slots[role.index()] = Slot::Input(data);
        self
    }

    pub fn bind_output(&mut self, role: ResourceRole, data: &'a mut [f32]) -> &mut Self {
        self.slots[role.index()] = Slot::Output(data);
        self
    }

    pub fn is_bound(&self, role: ResourceRole) -> bool {
        !matches!(self.slots[role.index()], Slot::Empty)
    }

    /// Shared view of an input slot.
    pub fn input(&self, role: ResourceRole) -> Option<&'a [f32]> {
        match &self.slots[role.index()] {
            Slot::Input(data) => Some(*data),
            _ => None,
        }
    }

    /// Moves an output slot out of the table so it can be written while inputs are read.
    pub fn take_output(&mut self, role: ResourceRole) -> Option<&'a mut [f32]> {
        match std::mem::replace(&mut self.slots[role.index()], Slot::Empty) {
            Slot::Output(data) => Some(data),
            other => {
                self.slots[role.index()] = other;
                None
            }
        }
    }

    /// Input for `role` holding exactly `len` values.
    pub fn require_input(&self, role: ResourceRole, len: usize) -> LibraryResult<&'a [f32]> {
        let data = self.input(role).ok_or(Status::UNEXPECTED_NULL_POINTER)?;
        if data.len() != len {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        Ok(data)
    }

    /// Output for `role` holding exactly `len` values.
    pub fn require_output(&mut self, role: ResourceRole, len: usize) -> LibraryResult<&'a mut [f32]> {
        let data = self
            .take_output(role)
            .ok_or(Status::UNEXPECTED_NULL_POINTER)?;
        if data.len() != len {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        Ok(data)
    }
}

impl Default for Resources<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_and_inputs_are_separate_slots() {
        let src = [1.0f32, 2.0];
        let mut dst = [0.0f32; 2];
        let mut resources = Resources::new();
        resources
            .bind_input(ResourceRole::Src, &src)
            .bind_output(ResourceRole::Dst, &mut dst);

        assert!(resources.input(ResourceRole::Dst).is_none());
        assert!(resources.take_output(ResourceRole::Src).is_none());
        assert!(resources.is_bound(ResourceRole::Src));

        let input = resources.input(ResourceRole::Src).unwrap();
        let output = resources.take_output(ResourceRole::Dst).unwrap();
        output.copy_from_slice(input);
        assert!(!resources.is_bound(ResourceRole::Dst));
        assert_eq!(dst, src);
    }

    #[test]
    fn required_slots_check_presence_and_length() {
        let src = [0.0f32; 3];
        let mut dst = [0.0f32; 2];
        let mut resources = Resources::new();
        resources
            .bind_input(ResourceRole::From, &src)
            .bind_output(ResourceRole::To, &mut dst);

        assert_eq!(
            resources.require_input(ResourceRole::From, 4),
            Err(Status::INCORRECT_INPUT_PARAMETER)
        );
        assert_eq!(
            resources.require_input(ResourceRole::Src, 3),
            Err(Status::UNEXPECTED_NULL_POINTER)
        );
        assert!(resources.require_output(ResourceRole::To, 2).is_ok());
    }
}
