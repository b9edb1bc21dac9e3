//! Bus discovery: from PDO mappings to named variables.
//!
//! After the stack has built the process image, discovery walks each
//! slave's PDO declaration and publishes one named [`PdVar`] per mapped
//! object into the bus directory. Two sources are tried in order:
//!
//! 1. **CoE**: read the sync-manager communication types (0x1C00), then
//!    the PDO assignment of the output and input sync managers (0x1C12 /
//!    0x1C13) and every mapping entry of every assigned PDO, resolving
//!    names through the object dictionary.
//! 2. **SII fallback**: slaves without a usable CoE mailbox are walked
//!    through the RxPDO/TxPDO categories of their EEPROM image, with
//!    names taken from the strings section.
//!
//! Published offsets are byte offsets into the direction's whole process
//! image, not slave-local, so a consumer can address a variable without
//! knowing which slave windows precede it. Discovery never fails the
//! bring-up: a slave that answers neither source publishes no variables
//! and the bus keeps running.

use ecx::bus::{EcatBus, PdDirection, PdVar, Slave};
use ecx::consts::MAX_SLAVES;
use tracing::{debug, info, warn};

use crate::stack::{
    MAX_SM, MasterStack, PDO_ASSIGN_INPUTS, PDO_ASSIGN_OUTPUTS, SDO_TIMEOUT, SII_CAT_RXPDO,
    SII_CAT_TXPDO, SM_COMM_TYPE, SM_TYPE_INPUTS, SM_TYPE_OUTPUTS,
};

/// Totals of one discovery pass, for the bring-up log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Slaves published into the directory.
    pub slaves: usize,
    /// Named variables published across all slaves and both directions.
    pub variables: usize,
    /// Total input image bytes covered by the published slaves.
    pub input_bytes: usize,
    /// Total output image bytes covered by the published slaves.
    pub output_bytes: usize,
}

/// Run discovery against a mapped stack and publish the result into `bus`.
///
/// Slave entries are rewritten from scratch, so repeated runs against the
/// same bus produce identical directories.
pub fn run(stack: &mut impl MasterStack, bus: &mut EcatBus) -> DiscoveryReport {
    let found = stack.slave_count();
    let published = found.min(MAX_SLAVES);
    if found > published {
        warn!(
            found,
            max = MAX_SLAVES,
            "slave directory full, publishing the first entries only"
        );
    }
    bus.slave_num = published as u32;

    let mut report = DiscoveryReport {
        slaves: published,
        ..Default::default()
    };
    let mut input_base = 0usize;
    let mut output_base = 0usize;

    for id in 0..published {
        let pos = (id + 1) as u16;
        let name = stack.slave_name(pos).to_string();
        let (input_bytes, output_bytes) = stack.slave_io_bytes(pos);

        let Some(slave) = bus.slave_mut(id) else {
            break;
        };
        *slave = Slave::default();
        slave.id = id as u32;
        slave.set_name(&name);

        let over_coe = coe_discover(stack, slave, pos, input_base, output_base);
        if !over_coe {
            sii_discover(stack, slave, pos, input_base, output_base);
        }

        debug!(
            slave = id,
            name = %slave.name(),
            inputs = slave.var_count(PdDirection::Input),
            outputs = slave.var_count(PdDirection::Output),
            source = if over_coe { "coe" } else { "sii" },
            "slave published"
        );
        report.variables +=
            slave.var_count(PdDirection::Input) + slave.var_count(PdDirection::Output);
        input_base += input_bytes;
        output_base += output_bytes;
    }

    report.input_bytes = input_base;
    report.output_bytes = output_base;
    info!(
        slaves = report.slaves,
        variables = report.variables,
        input_bytes = report.input_bytes,
        output_bytes = report.output_bytes,
        "discovery complete"
    );
    report
}

// ─── CoE route ──────────────────────────────────────────────────────

/// Map one slave's variables over its mailbox. Returns `false` when the
/// mailbox is unusable (no CoE, SDO failure, or fewer than three sync
/// managers) so the caller can fall back to the EEPROM.
fn coe_discover(
    stack: &mut impl MasterStack,
    slave: &mut Slave,
    pos: u16,
    input_base: usize,
    output_base: usize,
) -> bool {
    if !stack.has_coe(pos) {
        return false;
    }

    let mut count_buf = [0u8; 1];
    let (wkc, _) = stack.sdo_read(pos, SM_COMM_TYPE, 0, &mut count_buf, SDO_TIMEOUT);
    let sm_count = count_buf[0] as usize;
    if wkc <= 0 || sm_count <= 2 {
        return false;
    }

    // Classify the process-data sync managers first. Some firmware reports
    // the mailbox-read type (2) for SM2 and shifts every following type
    // down by one; the workaround has to look at the sequence as a whole
    // before any direction is walked.
    let last_sm = (sm_count - 1).min(MAX_SM - 1);
    let mut types: heapless::Vec<(u8, u8), MAX_SM> = heapless::Vec::new();
    let mut shift = 0u8;
    for sm in 2..=last_sm {
        let mut type_buf = [0u8; 1];
        let (wkc, _) =
            stack.sdo_read(pos, SM_COMM_TYPE, (sm + 1) as u8, &mut type_buf, SDO_TIMEOUT);
        let mut sm_type = if wkc > 0 { type_buf[0] } else { 0 };
        if sm == 2 && sm_type == 2 {
            debug!(slave = pos, "sync-manager type workaround active");
            shift = 1;
        }
        if sm_type != 0 {
            sm_type += shift;
        }
        debug!(slave = pos, sm, sm_type, "sync manager classified");
        let _ = types.push((sm as u8, sm_type));
    }

    if types.iter().any(|&(_, t)| t == SM_TYPE_OUTPUTS) {
        assign_walk(
            stack,
            slave,
            pos,
            PDO_ASSIGN_OUTPUTS,
            PdDirection::Output,
            output_base,
        );
    }
    if types.iter().any(|&(_, t)| t == SM_TYPE_INPUTS) {
        assign_walk(
            stack,
            slave,
            pos,
            PDO_ASSIGN_INPUTS,
            PdDirection::Input,
            input_base,
        );
    }
    true
}

/// Walk one PDO-assign object: every mapping entry of every assigned PDO
/// becomes a variable at the next free bit position. Padding entries
/// (object 0, subindex 0) and entries the dictionary has no name for
/// reserve their bits without being published.
fn assign_walk(
    stack: &mut impl MasterStack,
    slave: &mut Slave,
    pos: u16,
    assign: u16,
    dir: PdDirection,
    byte_base: usize,
) {
    let mut count_buf = [0u8; 2];
    let (wkc, _) = stack.sdo_read(pos, assign, 0, &mut count_buf, SDO_TIMEOUT);
    if wkc <= 0 {
        return;
    }
    // Assign entries live at subindexes 1.., so a u8 bounds the walk.
    let pdo_count = (u16::from_le_bytes(count_buf) as usize).min(u8::MAX as usize);

    let mut bits = 0usize;
    for n in 1..=pdo_count {
        let mut index_buf = [0u8; 2];
        let (wkc, _) = stack.sdo_read(pos, assign, n as u8, &mut index_buf, SDO_TIMEOUT);
        let pdo_index = u16::from_le_bytes(index_buf);
        if wkc <= 0 || pdo_index == 0 {
            continue;
        }

        let mut entries_buf = [0u8; 1];
        let (wkc, _) = stack.sdo_read(pos, pdo_index, 0, &mut entries_buf, SDO_TIMEOUT);
        if wkc <= 0 {
            continue;
        }
        for entry in 1..=entries_buf[0] {
            let mut word_buf = [0u8; 4];
            let (wkc, _) = stack.sdo_read(pos, pdo_index, entry, &mut word_buf, SDO_TIMEOUT);
            let word = if wkc > 0 {
                u32::from_le_bytes(word_buf)
            } else {
                0
            };
            let bit_len = (word & 0xFF) as usize;
            let object = (word >> 16) as u16;
            let sub = ((word >> 8) & 0xFF) as u8;
            if object != 0 || sub != 0 {
                match stack.od_entry_name(pos, object, sub) {
                    Some(name) => {
                        let var =
                            PdVar::new(&name, (byte_base + bits / 8) as u32, (bit_len / 8) as u32);
                        if !slave.push_var(dir, var) {
                            warn!(
                                slave = pos,
                                %dir,
                                name = %name,
                                "variable table full, entry dropped"
                            );
                        }
                    }
                    None => debug!(
                        slave = pos,
                        object = format_args!("{object:#06x}"),
                        sub,
                        "mapped object has no dictionary name, skipped"
                    ),
                }
            }
            bits += bit_len;
        }
    }
}

// ─── SII route ──────────────────────────────────────────────────────

fn sii_discover(
    stack: &mut impl MasterStack,
    slave: &mut Slave,
    pos: u16,
    input_base: usize,
    output_base: usize,
) {
    sii_walk(stack, slave, pos, SII_CAT_RXPDO, PdDirection::Output, output_base);
    sii_walk(stack, slave, pos, SII_CAT_TXPDO, PdDirection::Input, input_base);
}

fn sii_walk(
    stack: &mut impl MasterStack,
    slave: &mut Slave,
    pos: u16,
    category: u16,
    dir: PdDirection,
    byte_base: usize,
) {
    // A missing category just means nothing is mapped this way.
    let Some(len_addr) = stack.sii_find(pos, category) else {
        return;
    };
    if walk_category(stack, slave, pos, len_addr, dir, byte_base).is_none() {
        warn!(slave = pos, category, "EEPROM category truncated, walk stopped");
    }
}

/// Walk one EEPROM PDO category: an 8-byte header per PDO followed by one
/// 8-byte record per entry. Returns `None` if a read runs off the EEPROM
/// or the category ends mid-record.
fn walk_category(
    stack: &mut impl MasterStack,
    slave: &mut Slave,
    pos: u16,
    len_addr: u16,
    dir: PdDirection,
    byte_base: usize,
) -> Option<()> {
    let words = sii_u16(stack, pos, len_addr)?;
    let end = len_addr as usize + 2 + words as usize * 2;

    let mut addr = len_addr as usize + 2;
    let mut bits = 0usize;
    while addr + 8 <= end {
        let entry_count = stack.sii_byte(pos, (addr + 2) as u16)? as usize;
        let sm = stack.sii_byte(pos, (addr + 3) as u16)?;
        addr += 8;

        // A PDO parked on an out-of-range sync manager is not part of the
        // process image; its records are skipped without reserving bits.
        if sm as usize >= MAX_SM {
            addr += entry_count * 8;
            continue;
        }

        for _ in 0..entry_count {
            if addr + 8 > end {
                return None;
            }
            let object = sii_u16(stack, pos, addr as u16)?;
            let sub = stack.sii_byte(pos, (addr + 2) as u16)?;
            let name_index = stack.sii_byte(pos, (addr + 3) as u16)?;
            let bit_len = stack.sii_byte(pos, (addr + 5) as u16)? as usize;

            if object != 0 || sub != 0 {
                if let Some(name) = stack.sii_string(pos, name_index) {
                    let var =
                        PdVar::new(&name, (byte_base + bits / 8) as u32, (bit_len / 8) as u32);
                    if !slave.push_var(dir, var) {
                        warn!(
                            slave = pos,
                            %dir,
                            name = %name,
                            "variable table full, entry dropped"
                        );
                    }
                } else {
                    debug!(slave = pos, %dir, name_index, "entry without a string, skipped");
                }
            }
            bits += bit_len;
            addr += 8;
        }
    }
    Some(())
}

fn sii_u16(stack: &mut impl MasterStack, pos: u16, addr: u16) -> Option<u16> {
    let lo = stack.sii_byte(pos, addr)?;
    let hi = stack.sii_byte(pos, addr + 1)?;
    Some(u16::from_le_bytes([lo, hi]))
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimPdo, SimPdoEntry, SimSlave, SimStack};
    use ecx::consts::MAX_PD_VARS;

    fn discover(stack: &mut SimStack) -> (Box<EcatBus>, DiscoveryReport) {
        stack.init("sim").unwrap();
        stack.config_init().unwrap();
        stack.config_map().unwrap();
        let mut bus = Box::new(EcatBus::new());
        let report = run(stack, &mut bus);
        (bus, report)
    }

    fn var<'a>(bus: &'a EcatBus, slave: usize, dir: PdDirection, index: usize) -> &'a PdVar {
        bus.slave(slave).unwrap().var(dir, index).unwrap()
    }

    #[test]
    fn coe_slave_maps_in_declaration_order() {
        let (bus, _) = discover(&mut SimStack::demo());
        let servo = bus.slave(0).unwrap();
        assert_eq!(servo.name(), "servo_drive");

        let cw = var(&bus, 0, PdDirection::Output, 0);
        assert_eq!((cw.name(), cw.offset, cw.size), ("Controlword", 0, 2));
        let tv = var(&bus, 0, PdDirection::Output, 1);
        assert_eq!((tv.name(), tv.offset, tv.size), ("Target velocity", 2, 4));

        let sw = var(&bus, 0, PdDirection::Input, 0);
        assert_eq!((sw.name(), sw.offset, sw.size), ("Statusword", 0, 2));
        let va = var(&bus, 0, PdDirection::Input, 1);
        assert_eq!(
            (va.name(), va.offset, va.size),
            ("Velocity actual value", 2, 4)
        );
    }

    #[test]
    fn offsets_accumulate_across_slaves() {
        // The I/O block follows the servo's 6-byte windows in both images.
        let (bus, _) = discover(&mut SimStack::demo());
        let douts = var(&bus, 1, PdDirection::Output, 0);
        assert_eq!((douts.name(), douts.offset, douts.size), ("Digital outputs", 6, 1));
        let dins = var(&bus, 1, PdDirection::Input, 0);
        assert_eq!((dins.name(), dins.offset, dins.size), ("Digital inputs", 6, 1));
    }

    #[test]
    fn report_carries_totals() {
        let (_, report) = discover(&mut SimStack::demo());
        assert_eq!(
            report,
            DiscoveryReport {
                slaves: 2,
                variables: 6,
                input_bytes: 7,
                output_bytes: 7,
            }
        );
    }

    #[test]
    fn quirky_sync_manager_types_are_shifted_back() {
        let mut slave = SimSlave {
            name: "quirky".to_string(),
            coe: true,
            rx_pdos: vec![SimPdo::new(
                0x1600,
                2,
                vec![SimPdoEntry::new(0x7000, 1, 16, "Out word")],
            )],
            tx_pdos: vec![SimPdo::new(
                0x1A00,
                3,
                vec![SimPdoEntry::new(0x6000, 1, 16, "In word")],
            )],
            ..Default::default()
        };
        slave.sm2_reports_inputs = true;

        let (bus, _) = discover(&mut SimStack::new(vec![slave]));
        assert_eq!(var(&bus, 0, PdDirection::Output, 0).name(), "Out word");
        assert_eq!(var(&bus, 0, PdDirection::Input, 0).name(), "In word");
    }

    #[test]
    fn eeprom_fallback_without_mailbox() {
        let (bus, report) = discover(&mut SimStack::new(vec![SimSlave {
            name: "plain_io".to_string(),
            coe: false,
            rx_pdos: vec![SimPdo::new(
                0x1600,
                2,
                vec![SimPdoEntry::new(0x7000, 1, 8, "Relay bank")],
            )],
            tx_pdos: vec![SimPdo::new(
                0x1A00,
                3,
                vec![SimPdoEntry::new(0x6000, 1, 16, "Counter")],
            )],
            ..Default::default()
        }]));
        let relay = var(&bus, 0, PdDirection::Output, 0);
        assert_eq!((relay.name(), relay.offset, relay.size), ("Relay bank", 0, 1));
        let counter = var(&bus, 0, PdDirection::Input, 0);
        assert_eq!((counter.name(), counter.offset, counter.size), ("Counter", 0, 2));
        assert_eq!(report.variables, 2);
    }

    #[test]
    fn eeprom_fallback_when_sdo_reads_fail() {
        // CoE advertised but every SDO read comes back with work counter 0.
        let (bus, _) = discover(&mut SimStack::new(vec![SimSlave {
            name: "mute_mailbox".to_string(),
            coe: true,
            sdo_fail: true,
            tx_pdos: vec![SimPdo::new(
                0x1A00,
                3,
                vec![SimPdoEntry::new(0x6000, 1, 8, "State bits")],
            )],
            ..Default::default()
        }]));
        assert_eq!(var(&bus, 0, PdDirection::Input, 0).name(), "State bits");
    }

    #[test]
    fn filler_entries_reserve_space_unpublished() {
        let (bus, _) = discover(&mut SimStack::new(vec![SimSlave {
            name: "padded".to_string(),
            coe: true,
            rx_pdos: vec![SimPdo::new(
                0x1600,
                2,
                vec![
                    SimPdoEntry::new(0x7000, 1, 16, "Setpoint"),
                    SimPdoEntry::filler(8),
                    SimPdoEntry::new(0x7010, 1, 8, "Mode"),
                ],
            )],
            ..Default::default()
        }]));
        let slave = bus.slave(0).unwrap();
        assert_eq!(slave.var_count(PdDirection::Output), 2);
        let mode = var(&bus, 0, PdDirection::Output, 1);
        assert_eq!((mode.name(), mode.offset, mode.size), ("Mode", 3, 1));
    }

    #[test]
    fn unnamed_entries_reserve_space_unpublished() {
        let (bus, _) = discover(&mut SimStack::new(vec![SimSlave {
            name: "partial_od".to_string(),
            coe: true,
            rx_pdos: vec![SimPdo::new(
                0x1600,
                2,
                vec![
                    SimPdoEntry::unnamed(0x7000, 1, 16),
                    SimPdoEntry::new(0x7010, 1, 8, "Out"),
                ],
            )],
            ..Default::default()
        }]));
        let slave = bus.slave(0).unwrap();
        assert_eq!(slave.var_count(PdDirection::Output), 1);
        let out = var(&bus, 0, PdDirection::Output, 0);
        assert_eq!((out.name(), out.offset), ("Out", 2));
    }

    #[test]
    fn sub_byte_entries_publish_zero_size() {
        // A single bit maps to size 0: visible in the directory, not
        // addressable through the typed accessors.
        let (bus, _) = discover(&mut SimStack::new(vec![SimSlave {
            name: "bit_io".to_string(),
            coe: false,
            tx_pdos: vec![SimPdo::new(
                0x1A00,
                3,
                vec![
                    SimPdoEntry::new(0x6000, 1, 1, "Limit switch"),
                    SimPdoEntry::new(0x6000, 2, 1, "Home switch"),
                ],
            )],
            ..Default::default()
        }]));
        let limit = var(&bus, 0, PdDirection::Input, 0);
        assert_eq!((limit.name(), limit.offset, limit.size), ("Limit switch", 0, 0));
        let home = var(&bus, 0, PdDirection::Input, 1);
        assert_eq!((home.name(), home.offset, home.size), ("Home switch", 0, 0));
    }

    #[test]
    fn eeprom_pdo_on_out_of_range_sync_manager_is_skipped() {
        let (bus, _) = discover(&mut SimStack::new(vec![SimSlave {
            name: "deactivated".to_string(),
            coe: false,
            rx_pdos: vec![
                SimPdo::new(0x1600, 9, vec![SimPdoEntry::new(0x7000, 1, 16, "Ghost")]),
                SimPdo::new(0x1601, 2, vec![SimPdoEntry::new(0x7010, 1, 8, "Real")]),
            ],
            ..Default::default()
        }]));
        let slave = bus.slave(0).unwrap();
        assert_eq!(slave.var_count(PdDirection::Output), 1);
        // The parked PDO reserved no bits either.
        let real = var(&bus, 0, PdDirection::Output, 0);
        assert_eq!((real.name(), real.offset), ("Real", 0));
    }

    #[test]
    fn variable_table_caps_at_capacity() {
        let entries = (0..MAX_PD_VARS + 1)
            .map(|i| SimPdoEntry::new(0x6000, (i + 1) as u8, 8, &format!("Channel {i}")))
            .collect();
        let (bus, _) = discover(&mut SimStack::new(vec![SimSlave {
            name: "many_channels".to_string(),
            coe: true,
            tx_pdos: vec![SimPdo::new(0x1A00, 3, entries)],
            ..Default::default()
        }]));
        let slave = bus.slave(0).unwrap();
        assert_eq!(slave.var_count(PdDirection::Input), MAX_PD_VARS);
        assert_eq!(
            var(&bus, 0, PdDirection::Input, MAX_PD_VARS - 1).name(),
            format!("Channel {}", MAX_PD_VARS - 1)
        );
    }

    #[test]
    fn slave_list_clamps_to_directory_capacity() {
        let slaves = (0..MAX_SLAVES + 1)
            .map(|i| SimSlave {
                name: format!("filler_{i}"),
                ..Default::default()
            })
            .collect();
        let (bus, report) = discover(&mut SimStack::new(slaves));
        assert_eq!(report.slaves, MAX_SLAVES);
        assert_eq!(bus.slaves().len(), MAX_SLAVES);
        assert_eq!(bus.slave(MAX_SLAVES - 1).unwrap().name(), "filler_49");
    }

    #[test]
    fn repeated_runs_produce_identical_directories() {
        let mut stack = SimStack::demo();
        let (bus, first) = discover(&mut stack);
        let mut again = Box::new(EcatBus::new());
        let second = run(&mut stack, &mut again);

        assert_eq!(first, second);
        for id in 0..first.slaves {
            for dir in [PdDirection::Input, PdDirection::Output] {
                let a = bus.slave(id).unwrap().vars(dir);
                let b = again.slave(id).unwrap().vars(dir);
                assert_eq!(a.len(), b.len());
                for (x, y) in a.iter().zip(b) {
                    assert_eq!((x.name(), x.offset, x.size), (y.name(), y.offset, y.size));
                }
            }
        }
    }
}
