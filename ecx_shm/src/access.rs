//! Typed access to process variables and the consumer attach facade.
//!
//! Process variables are raw little-endian byte windows; this module puts a
//! closed, sealed set of POD value types on top. A read or write names a
//! slave, a direction and a variable (by per-direction index or by name),
//! is checked against the published layout, and only then touches the image
//! region. No sentinel values: every failure is an error, every success a
//! real value.

use tracing::debug;

use crate::directory::BusDirectory;
use crate::error::{ShmError, ShmResult};
use crate::region::{ProcessDataRegion, Role};
use crate::sync::{SlotToken, SyncBroker};
use ecx::bus::{EcatBus, PdDirection, Slave};
use ecx::consts::{bus_segment_name, input_segment_name, output_segment_name};
use ecx::state::AlState;

mod sealed {
    pub trait Sealed {}
}

/// A process-value type: one of the closed set of little-endian POD
/// numerics that can live in a process variable.
///
/// The set is sealed; the typed accessors refuse any value whose size does
/// not exactly match the discovered variable size.
pub trait PdValue: sealed::Sealed + Copy {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Byte-array form of the value.
    type Bytes: AsRef<[u8]> + AsMut<[u8]> + Default;
    /// Encode to little-endian bytes.
    fn to_le(self) -> Self::Bytes;
    /// Decode from little-endian bytes.
    fn from_le(bytes: Self::Bytes) -> Self;
}

macro_rules! impl_pd_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl PdValue for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();
                type Bytes = [u8; core::mem::size_of::<$ty>()];

                fn to_le(self) -> Self::Bytes {
                    self.to_le_bytes()
                }

                fn from_le(bytes: Self::Bytes) -> Self {
                    Self::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_pd_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Look up a variable and check the caller's size against the discovered
/// one.
fn checked_var(
    bus: &EcatBus,
    slave: usize,
    dir: PdDirection,
    index: usize,
    requested: usize,
) -> ShmResult<(usize, usize)> {
    let (offset, size) = var_window(bus, slave, dir, index)?;
    if size != requested {
        return Err(ShmError::SizeMismatch {
            var: size,
            requested,
        });
    }
    Ok((offset, size))
}

/// Byte window of a variable, without a size check.
fn var_window(
    bus: &EcatBus,
    slave: usize,
    dir: PdDirection,
    index: usize,
) -> ShmResult<(usize, usize)> {
    let entry = bus.slave(slave).ok_or(ShmError::SlaveNotFound {
        id: slave,
        count: bus.slaves().len(),
    })?;
    let var = entry
        .var(dir, index)
        .ok_or_else(|| ShmError::VarIndexOutOfRange {
            slave,
            dir,
            index,
            count: entry.var_count(dir),
        })?;
    Ok((var.offset as usize, var.size as usize))
}

/// Resolve a variable name to its per-direction index.
pub fn resolve_var(
    bus: &EcatBus,
    slave: usize,
    dir: PdDirection,
    name: &str,
) -> ShmResult<usize> {
    let entry = bus.slave(slave).ok_or(ShmError::SlaveNotFound {
        id: slave,
        count: bus.slaves().len(),
    })?;
    entry
        .find_var(dir, name)
        .map(|(index, _)| index)
        .ok_or_else(|| ShmError::VarNotFound {
            slave,
            dir,
            name: name.to_string(),
        })
}

/// Typed read of variable `index` from one direction's image.
pub fn read_value<T: PdValue>(
    bus: &EcatBus,
    region: &ProcessDataRegion,
    slave: usize,
    dir: PdDirection,
    index: usize,
) -> ShmResult<T> {
    let (offset, _) = checked_var(bus, slave, dir, index, T::SIZE)?;
    let raw = region.read_at(offset, T::SIZE)?;
    let mut bytes = T::Bytes::default();
    bytes.as_mut().copy_from_slice(raw);
    Ok(T::from_le(bytes))
}

/// Typed write of variable `index` into one direction's image.
pub fn write_value<T: PdValue>(
    bus: &EcatBus,
    region: &mut ProcessDataRegion,
    slave: usize,
    dir: PdDirection,
    index: usize,
    value: T,
) -> ShmResult<()> {
    let (offset, _) = checked_var(bus, slave, dir, index, T::SIZE)?;
    region.write_at(offset, value.to_le().as_ref())
}

/// Cycle-time statistics published by the master, microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleTimes {
    /// Shortest cycle since the last reset.
    pub min_us: f64,
    /// Longest cycle since the last reset.
    pub max_us: f64,
    /// Mean cycle since the last reset.
    pub avg_us: f64,
    /// Most recent cycle.
    pub current_us: f64,
}

/// Attach-side facade bundling the directory, both image regions and the
/// tick broker of one bus instance.
pub struct BusClient {
    directory: BusDirectory,
    input: ProcessDataRegion,
    output: ProcessDataRegion,
    broker: SyncBroker,
}

impl BusClient {
    /// Attach to a running master instance.
    ///
    /// Fails with [`ShmError::NotReady`] until the master has published the
    /// directory and both image regions.
    pub fn attach(instance: u32) -> ShmResult<Self> {
        let directory =
            BusDirectory::open_or_create(&bus_segment_name(instance), Role::Attacher)?;
        let input = ProcessDataRegion::open(&input_segment_name(instance))?;
        let output = ProcessDataRegion::open(&output_segment_name(instance))?;
        let broker = SyncBroker::attach(instance)?;
        debug!(instance, "attached bus client");
        Ok(Self {
            directory,
            input,
            output,
            broker,
        })
    }

    /// The mapped bus directory.
    pub fn directory(&self) -> &BusDirectory {
        &self.directory
    }

    /// Number of slaves on the published bus.
    pub fn slave_count(&self) -> usize {
        self.directory.bus().slaves().len()
    }

    /// Name of slave `id`.
    pub fn slave_name(&self, id: usize) -> ShmResult<&str> {
        Ok(self.directory.slave(id)?.name())
    }

    /// First slave with this name.
    pub fn find_slave_by_name(&self, name: &str) -> Option<(usize, &Slave)> {
        self.directory.find_slave_by_name(name)
    }

    /// Number of variables of slave `id` in one direction.
    pub fn var_count(&self, id: usize, dir: PdDirection) -> ShmResult<usize> {
        Ok(self.directory.slave(id)?.var_count(dir))
    }

    // ─── Typed value access ─────────────────────────────────────────

    /// Read an input variable by per-direction index.
    pub fn input<T: PdValue>(&self, slave: usize, index: usize) -> ShmResult<T> {
        read_value(
            self.directory.bus(),
            &self.input,
            slave,
            PdDirection::Input,
            index,
        )
    }

    /// Read an input variable by name.
    pub fn input_by_name<T: PdValue>(&self, slave: usize, name: &str) -> ShmResult<T> {
        let index = resolve_var(self.directory.bus(), slave, PdDirection::Input, name)?;
        self.input(slave, index)
    }

    /// Read back an output variable by per-direction index.
    pub fn output<T: PdValue>(&self, slave: usize, index: usize) -> ShmResult<T> {
        read_value(
            self.directory.bus(),
            &self.output,
            slave,
            PdDirection::Output,
            index,
        )
    }

    /// Read back an output variable by name.
    pub fn output_by_name<T: PdValue>(&self, slave: usize, name: &str) -> ShmResult<T> {
        let index = resolve_var(self.directory.bus(), slave, PdDirection::Output, name)?;
        self.output(slave, index)
    }

    /// Write an output variable by per-direction index.
    pub fn set_output<T: PdValue>(
        &mut self,
        slave: usize,
        index: usize,
        value: T,
    ) -> ShmResult<()> {
        write_value(
            self.directory.bus(),
            &mut self.output,
            slave,
            PdDirection::Output,
            index,
            value,
        )
    }

    /// Write an output variable by name.
    pub fn set_output_by_name<T: PdValue>(
        &mut self,
        slave: usize,
        name: &str,
        value: T,
    ) -> ShmResult<()> {
        let index = resolve_var(self.directory.bus(), slave, PdDirection::Output, name)?;
        self.set_output(slave, index, value)
    }

    /// Borrow an input variable's raw bytes.
    pub fn input_view(&self, slave: usize, index: usize) -> ShmResult<&[u8]> {
        let (offset, len) = var_window(self.directory.bus(), slave, PdDirection::Input, index)?;
        self.input.read_at(offset, len)
    }

    /// Mutably borrow an output variable's raw bytes.
    pub fn output_view_mut(&mut self, slave: usize, index: usize) -> ShmResult<&mut [u8]> {
        let (offset, len) =
            var_window(self.directory.bus(), slave, PdDirection::Output, index)?;
        self.output.view_mut(offset, len)
    }

    // ─── Bus state and statistics ───────────────────────────────────

    /// Wall-clock time of the last completed cycle, microseconds since the
    /// Unix epoch.
    pub fn timestamp_us(&self) -> i64 {
        self.directory.bus().timestamp
    }

    /// Published cycle-time statistics.
    pub fn cycle_times(&self) -> CycleTimes {
        let bus = self.directory.bus();
        CycleTimes {
            min_us: bus.min_cycle_us,
            max_us: bus.max_cycle_us,
            avg_us: bus.avg_cycle_us,
            current_us: bus.current_cycle_us,
        }
    }

    /// Ask the master to restart min/max/avg tracking.
    pub fn request_stats_reset(&mut self) {
        self.directory.bus_mut().reset_cycle_stats = 1;
    }

    /// Current bus state, `None` for a raw value no [`AlState`] maps to.
    pub fn state(&self) -> Option<AlState> {
        AlState::from_u8(self.directory.bus().current_state)
    }

    /// Current bus state as the raw published byte.
    pub fn state_raw(&self) -> u8 {
        self.directory.bus().current_state
    }

    /// State the master is expected to settle in.
    pub fn next_expected_state(&self) -> Option<AlState> {
        AlState::from_u8(self.directory.bus().next_expected_state)
    }

    /// Ask the master to bring the bus to `state`.
    pub fn request_state(&mut self, state: AlState) {
        self.directory.bus_mut().request_state = state.as_u8();
    }

    /// `true` once the master reached OP and released the bus for writers.
    pub fn is_authorized(&self) -> bool {
        self.directory.bus().is_authorized != 0
    }

    // ─── Cycle synchronization ──────────────────────────────────────

    /// Claim a consumer slot on this instance's tick broker.
    pub fn register(&mut self) -> ShmResult<SlotToken> {
        self.broker.register(&self.directory)
    }

    /// Block until the next cycle tick.
    pub fn wait_cycle(&self, token: &SlotToken) -> ShmResult<()> {
        self.broker.wait(token)
    }

    /// Consume a pending tick if one is there.
    pub fn try_wait_cycle(&self, token: &SlotToken) -> ShmResult<bool> {
        self.broker.try_wait(token)
    }
}

// ─────────────────────────────── Tests ───────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ecx::bus::PdVar;

    fn servo_bus() -> EcatBus {
        let mut bus = EcatBus::new();
        bus.slave_num = 1;
        let slave = bus.slave_mut(0).unwrap();
        slave.id = 0;
        slave.set_name("servo");
        slave.push_var(PdDirection::Output, PdVar::new("Controlword", 0, 2));
        slave.push_var(PdDirection::Output, PdVar::new("Target velocity", 2, 4));
        slave.push_var(PdDirection::Input, PdVar::new("Statusword", 0, 2));
        slave.push_var(PdDirection::Input, PdVar::new("Velocity actual", 2, 4));
        slave.push_var(PdDirection::Input, PdVar::new("Analog 1", 6, 4));
        bus
    }

    fn test_region(tag: &str, size: usize) -> ProcessDataRegion {
        let name = format!("ecx_test_access_{}_{}", tag, std::process::id());
        ProcessDataRegion::create(&name, size).unwrap()
    }

    fn drop_region(region: ProcessDataRegion) {
        let name = region.name().to_string();
        drop(region);
        ProcessDataRegion::unlink(&name).unwrap();
    }

    #[test]
    fn typed_write_then_read() {
        let bus = servo_bus();
        let mut region = test_region("rw", 6);

        write_value::<u16>(&bus, &mut region, 0, PdDirection::Output, 0, 0x000F).unwrap();
        write_value::<i32>(&bus, &mut region, 0, PdDirection::Output, 1, -120_000).unwrap();

        let cw: u16 = read_value(&bus, &region, 0, PdDirection::Output, 0).unwrap();
        let vel: i32 = read_value(&bus, &region, 0, PdDirection::Output, 1).unwrap();
        assert_eq!(cw, 0x000F);
        assert_eq!(vel, -120_000);
        // Little-endian at the discovered offsets.
        assert_eq!(region.read_at(0, 2).unwrap(), &[0x0F, 0x00]);

        drop_region(region);
    }

    #[test]
    fn float_values_roundtrip() {
        let bus = servo_bus();
        let mut region = test_region("float", 10);

        write_value::<f32>(&bus, &mut region, 0, PdDirection::Input, 2, 3.5).unwrap();
        let back: f32 = read_value(&bus, &region, 0, PdDirection::Input, 2).unwrap();
        assert_eq!(back, 3.5);

        drop_region(region);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let bus = servo_bus();
        let mut region = test_region("size", 6);

        assert!(matches!(
            read_value::<u32>(&bus, &region, 0, PdDirection::Output, 0),
            Err(ShmError::SizeMismatch { var: 2, requested: 4 })
        ));
        assert!(matches!(
            write_value::<u8>(&bus, &mut region, 0, PdDirection::Output, 1, 1),
            Err(ShmError::SizeMismatch { var: 4, requested: 1 })
        ));

        drop_region(region);
    }

    #[test]
    fn lookup_errors_carry_context() {
        let bus = servo_bus();
        let region = test_region("lookup", 6);

        assert!(matches!(
            read_value::<u16>(&bus, &region, 3, PdDirection::Input, 0),
            Err(ShmError::SlaveNotFound { id: 3, count: 1 })
        ));
        assert!(matches!(
            read_value::<u16>(&bus, &region, 0, PdDirection::Output, 2),
            Err(ShmError::VarIndexOutOfRange { index: 2, count: 2, .. })
        ));
        assert!(matches!(
            resolve_var(&bus, 0, PdDirection::Input, "Controlword"),
            Err(ShmError::VarNotFound { .. })
        ));
        assert_eq!(
            resolve_var(&bus, 0, PdDirection::Output, "Controlword").unwrap(),
            0
        );

        drop_region(region);
    }
}
