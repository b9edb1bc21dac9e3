//! Bus capacities and shared-resource naming.
//!
//! These constants bound every fixed-capacity structure in the shared bus
//! directory. They are the single source of truth - all other crates import
//! from here. Changing any of them changes the directory layout and therefore
//! the layout version hash, so old and new builds refuse to attach to each
//! other instead of misreading the segment.

/// Maximum number of slaves the bus directory can describe.
pub const MAX_SLAVES: usize = 50;

/// Maximum number of process variables per direction per slave.
pub const MAX_PD_VARS: usize = 25;

/// Fixed byte length of a process-variable name, including the NUL terminator.
pub const MAX_PD_NAME_LEN: usize = 72;

/// Fixed byte length of a slave name, including the NUL terminator.
pub const MAX_SLAVE_NAME_LEN: usize = 80;

/// Number of consumer tick-semaphore slots per bus instance.
pub const SYNC_SLOTS: usize = 10;

/// Upper bound for one direction's process-data image in bytes.
///
/// Generous for real topologies (50 slaves with fully packed PDOs stay far
/// below this); mainly a guard against a corrupted size reaching `ftruncate`.
pub const PD_IMAGE_MAX_SIZE: usize = 5 * 1024 * 1024;

/// Name of the bus-directory segment for a given instance id.
pub fn bus_segment_name(instance: u32) -> String {
    format!("ecx_bus_{instance}")
}

/// Name of the input (slave→master) process-data segment.
pub fn input_segment_name(instance: u32) -> String {
    format!("ecx_pdi_{instance}")
}

/// Name of the output (master→slave) process-data segment.
pub fn output_segment_name(instance: u32) -> String {
    format!("ecx_pdo_{instance}")
}

/// Name of one consumer tick semaphore.
///
/// POSIX named semaphores require the leading slash; the segment names above
/// are plain file names under `/dev/shm`.
pub fn tick_semaphore_name(instance: u32, slot: usize) -> String {
    format!("/ecx_tick_{instance}_{slot}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities_are_nonzero() {
        assert!(MAX_SLAVES > 0);
        assert!(MAX_PD_VARS > 0);
        assert!(SYNC_SLOTS > 0);
    }

    #[test]
    fn name_lengths_leave_room_for_nul() {
        assert!(MAX_PD_NAME_LEN > 1);
        assert!(MAX_SLAVE_NAME_LEN > 1);
    }

    #[test]
    fn segment_names_are_instance_scoped() {
        assert_eq!(bus_segment_name(0), "ecx_bus_0");
        assert_eq!(input_segment_name(3), "ecx_pdi_3");
        assert_eq!(output_segment_name(7), "ecx_pdo_7");
        assert_ne!(bus_segment_name(0), bus_segment_name(1));
    }

    #[test]
    fn semaphore_names_carry_slash_and_slot() {
        assert_eq!(tick_semaphore_name(0, 0), "/ecx_tick_0_0");
        assert_eq!(tick_semaphore_name(2, 9), "/ecx_tick_2_9");
    }
}
