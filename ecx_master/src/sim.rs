//! Simulated fieldbus backend.
//!
//! [`SimStack`] implements [`MasterStack`] over an in-memory bus built from
//! [`SimSlave`] descriptions. Each simulated slave answers the CoE mapping
//! objects (0x1C00, 0x1C12/0x1C13, and its PDO mapping entries) and carries
//! a synthesized EEPROM with RxPDO/TxPDO categories and a strings table, so
//! both discovery paths run against the same description. SDO downloads
//! land in a per-slave object store and read back verbatim; the mapping
//! objects keep answering from the bus description. The cyclic exchange
//! loops every slave's outputs back to its inputs, which makes data flow
//! visible end to end without hardware.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use ecx::state::{AL_ERROR_FLAG, AlState};

use crate::stack::{
    MAX_SM, MasterStack, PDO_ASSIGN_INPUTS, PDO_ASSIGN_OUTPUTS, SII_CAT_RXPDO, SII_CAT_TXPDO,
    SM_COMM_TYPE, SM_TYPE_INPUTS, SM_TYPE_OUTPUTS, StackError,
};

// ─── Bus description ────────────────────────────────────────────────

/// One mapped object in a simulated PDO.
#[derive(Debug, Clone)]
pub struct SimPdoEntry {
    /// Object-dictionary index.
    pub object: u16,
    /// Object-dictionary subindex.
    pub sub: u8,
    /// Mapped length in bits.
    pub bit_len: u8,
    /// Entry name, `None` for entries without one.
    pub name: Option<String>,
}

impl SimPdoEntry {
    /// Named entry.
    pub fn new(object: u16, sub: u8, bit_len: u8, name: &str) -> Self {
        Self {
            object,
            sub,
            bit_len,
            name: Some(name.to_string()),
        }
    }

    /// Entry whose name the slave cannot provide.
    pub fn unnamed(object: u16, sub: u8, bit_len: u8) -> Self {
        Self {
            object,
            sub,
            bit_len,
            name: None,
        }
    }

    /// Padding entry (object 0, subindex 0) occupying `bit_len` bits.
    pub fn filler(bit_len: u8) -> Self {
        Self {
            object: 0,
            sub: 0,
            bit_len,
            name: None,
        }
    }
}

/// One simulated PDO with its sync-manager assignment.
#[derive(Debug, Clone)]
pub struct SimPdo {
    /// PDO index (0x1600.. for RxPDO, 0x1A00.. for TxPDO by convention).
    pub index: u16,
    /// Sync manager this PDO is assigned to.
    pub sm: u8,
    /// Mapped entries in wire order.
    pub entries: Vec<SimPdoEntry>,
}

impl SimPdo {
    /// PDO on an explicit sync manager.
    pub fn new(index: u16, sm: u8, entries: Vec<SimPdoEntry>) -> Self {
        Self { index, sm, entries }
    }
}

/// Description of one simulated slave.
#[derive(Debug, Clone, Default)]
pub struct SimSlave {
    /// Identity name, as a real slave reports from EEPROM.
    pub name: String,
    /// Whether the mailbox supports CoE.
    pub coe: bool,
    /// When set, every SDO read fails with work counter 0.
    pub sdo_fail: bool,
    /// Firmware quirk: the output sync manager reports comm type 2 and the
    /// following sync managers are shifted down by one as well.
    pub sm2_reports_inputs: bool,
    /// Output PDOs (master to slave).
    pub rx_pdos: Vec<SimPdo>,
    /// Input PDOs (slave to master).
    pub tx_pdos: Vec<SimPdo>,
}

// ─── Per-slave derived state ────────────────────────────────────────

#[derive(Debug)]
struct SlaveState {
    cfg: SimSlave,
    eeprom: Vec<u8>,
    categories: HashMap<u16, u16>,
    strings: Vec<String>,
    od_store: HashMap<(u16, u8), Vec<u8>>,
    input_bytes: usize,
    output_bytes: usize,
    input_base: usize,
    output_base: usize,
}

impl SlaveState {
    fn build(cfg: SimSlave) -> Self {
        let input_bytes = image_bytes(&cfg.tx_pdos);
        let output_bytes = image_bytes(&cfg.rx_pdos);

        let mut strings = Vec::new();
        let mut eeprom = Vec::new();
        let mut categories = HashMap::new();
        for (cat, pdos) in [(SII_CAT_RXPDO, &cfg.rx_pdos), (SII_CAT_TXPDO, &cfg.tx_pdos)] {
            let payload = build_pdo_section(pdos, &mut strings);
            categories.insert(cat, eeprom.len() as u16);
            eeprom.extend_from_slice(&((payload.len() / 2) as u16).to_le_bytes());
            eeprom.extend_from_slice(&payload);
        }

        Self {
            cfg,
            eeprom,
            categories,
            strings,
            od_store: HashMap::new(),
            input_bytes,
            output_bytes,
            input_base: 0,
            output_base: 0,
        }
    }

    /// Comm type of one sync manager, with the shift quirk applied.
    fn comm_type(&self, sm: usize) -> u8 {
        let t = match sm {
            0 => 1,
            1 => 2,
            2 => SM_TYPE_OUTPUTS,
            3 => SM_TYPE_INPUTS,
            _ => 0,
        };
        if self.cfg.sm2_reports_inputs && sm >= 2 && t != 0 {
            t - 1
        } else {
            t
        }
    }

    fn find_pdo(&self, index: u16) -> Option<&SimPdo> {
        self.cfg
            .rx_pdos
            .iter()
            .chain(self.cfg.tx_pdos.iter())
            .find(|p| p.index == index)
    }
}

/// Mapped byte size of one direction; PDOs on out-of-range sync managers
/// are not part of the image.
fn image_bytes(pdos: &[SimPdo]) -> usize {
    let bits: usize = pdos
        .iter()
        .filter(|p| (p.sm as usize) < MAX_SM)
        .flat_map(|p| p.entries.iter())
        .map(|e| e.bit_len as usize)
        .sum();
    bits.div_ceil(8)
}

/// Serialize PDOs into the EEPROM category wire format: an 8-byte header
/// per PDO, an 8-byte record per entry, names collected into the shared
/// strings table (1-based, 0 = unnamed).
fn build_pdo_section(pdos: &[SimPdo], strings: &mut Vec<String>) -> Vec<u8> {
    let mut out = Vec::new();
    for pdo in pdos {
        out.extend_from_slice(&pdo.index.to_le_bytes());
        out.push(pdo.entries.len() as u8);
        out.push(pdo.sm);
        out.extend_from_slice(&[0u8; 4]);
        for entry in &pdo.entries {
            out.extend_from_slice(&entry.object.to_le_bytes());
            out.push(entry.sub);
            let name_idx = match &entry.name {
                Some(name) => {
                    strings.push(name.clone());
                    strings.len() as u8
                }
                None => 0,
            };
            out.push(name_idx);
            out.push(0); // data type, not consumed by the walker
            out.push(entry.bit_len);
            out.extend_from_slice(&[0u8; 2]);
        }
    }
    out
}

fn put(buf: &mut [u8], bytes: &[u8]) -> (i32, usize) {
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    (1, n)
}

// ─── The stack ──────────────────────────────────────────────────────

/// In-memory [`MasterStack`] implementation.
#[derive(Debug)]
pub struct SimStack {
    slaves: Vec<SlaveState>,
    ifname: String,
    initialized: bool,
    mapped: bool,
    state: u8,
    requested: u8,
    op_checks_needed: u32,
    wkc_override: Option<i32>,
    input_image: Vec<u8>,
    output_image: Vec<u8>,
    errors: VecDeque<String>,
}

impl SimStack {
    /// Build a bus from slave descriptions, in topology order.
    pub fn new(slaves: Vec<SimSlave>) -> Self {
        Self {
            slaves: slaves.into_iter().map(SlaveState::build).collect(),
            ifname: String::new(),
            initialized: false,
            mapped: false,
            state: AlState::Init.as_u8(),
            requested: AlState::Init.as_u8(),
            op_checks_needed: 0,
            wkc_override: None,
            input_image: Vec::new(),
            output_image: Vec::new(),
            errors: VecDeque::new(),
        }
    }

    /// Two-slave demo bus: a CoE servo drive and an EEPROM-only I/O block.
    pub fn demo() -> Self {
        Self::new(vec![
            SimSlave {
                name: "servo_drive".to_string(),
                coe: true,
                rx_pdos: vec![SimPdo::new(
                    0x1600,
                    2,
                    vec![
                        SimPdoEntry::new(0x6040, 0, 16, "Controlword"),
                        SimPdoEntry::new(0x60FF, 0, 32, "Target velocity"),
                    ],
                )],
                tx_pdos: vec![SimPdo::new(
                    0x1A00,
                    3,
                    vec![
                        SimPdoEntry::new(0x6041, 0, 16, "Statusword"),
                        SimPdoEntry::new(0x606C, 0, 32, "Velocity actual value"),
                    ],
                )],
                ..Default::default()
            },
            SimSlave {
                name: "io_block".to_string(),
                coe: false,
                rx_pdos: vec![SimPdo::new(
                    0x1601,
                    2,
                    vec![SimPdoEntry::new(0x7000, 1, 8, "Digital outputs")],
                )],
                tx_pdos: vec![SimPdo::new(
                    0x1A01,
                    3,
                    vec![SimPdoEntry::new(0x6000, 1, 8, "Digital inputs")],
                )],
                ..Default::default()
            },
        ])
    }

    /// Force every following exchange to report this work counter.
    pub fn set_wkc_override(&mut self, wkc: Option<i32>) {
        self.wkc_override = wkc;
    }

    /// Delay OP: the bus reaches OP only after this many state checks.
    pub fn set_op_checks_needed(&mut self, checks: u32) {
        self.op_checks_needed = checks;
    }

    /// Force the bus into an arbitrary state, as a slave backslide would
    /// leave it. Error-flagged values are legal.
    pub fn force_state(&mut self, state: u8) {
        self.state = state;
    }

    /// Queue a message on the stack's error list.
    pub fn inject_error(&mut self, msg: &str) {
        self.errors.push_back(msg.to_string());
    }

    fn slave_state(&self, slave: u16) -> Option<&SlaveState> {
        if slave == 0 {
            return None;
        }
        self.slaves.get(slave as usize - 1)
    }

    fn slave_state_mut(&mut self, slave: u16) -> Option<&mut SlaveState> {
        if slave == 0 {
            return None;
        }
        self.slaves.get_mut(slave as usize - 1)
    }
}

impl MasterStack for SimStack {
    fn init(&mut self, ifname: &str) -> Result<(), StackError> {
        if ifname.is_empty() {
            return Err(StackError::InterfaceOpen {
                ifname: ifname.to_string(),
            });
        }
        self.ifname = ifname.to_string();
        self.initialized = true;
        Ok(())
    }

    fn config_init(&mut self) -> Result<usize, StackError> {
        if !self.initialized {
            return Err(StackError::InterfaceOpen {
                ifname: self.ifname.clone(),
            });
        }
        if !self.slaves.is_empty() {
            self.state = AlState::PreOp.as_u8();
            self.requested = self.state;
        }
        Ok(self.slaves.len())
    }

    fn config_map(&mut self) -> Result<usize, StackError> {
        let mut input_base = 0;
        let mut output_base = 0;
        for s in &mut self.slaves {
            s.input_base = input_base;
            s.output_base = output_base;
            input_base += s.input_bytes;
            output_base += s.output_bytes;
        }
        self.input_image = vec![0; input_base];
        self.output_image = vec![0; output_base];
        self.mapped = true;
        self.state = AlState::SafeOp.as_u8();
        self.requested = self.state;
        Ok(input_base + output_base)
    }

    fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    fn slave_name(&self, slave: u16) -> &str {
        self.slave_state(slave).map_or("", |s| s.cfg.name.as_str())
    }

    fn slave_io_bytes(&self, slave: u16) -> (usize, usize) {
        self.slave_state(slave)
            .map_or((0, 0), |s| (s.input_bytes, s.output_bytes))
    }

    fn has_coe(&self, slave: u16) -> bool {
        self.slave_state(slave).is_some_and(|s| s.cfg.coe)
    }

    fn expected_wkc(&self) -> i32 {
        let outputs = self.slaves.iter().filter(|s| s.output_bytes > 0).count() as i32;
        let inputs = self.slaves.iter().filter(|s| s.input_bytes > 0).count() as i32;
        outputs * 2 + inputs
    }

    fn request_state(&mut self, _slave: u16, state: u8) {
        self.requested = state;
        // Writing the error-flagged state back acknowledges it: the flag
        // clears and the slave settles in the underlying state.
        if state & AL_ERROR_FLAG != 0 && state == self.state {
            self.state = state & !AL_ERROR_FLAG;
            return;
        }
        if state != AlState::Op.as_u8() || self.op_checks_needed == 0 {
            self.state = state;
        }
    }

    fn check_state(&mut self, _slave: u16, state: u8, _timeout: Duration) -> u8 {
        if self.requested == state && self.state != state && self.op_checks_needed > 0 {
            self.op_checks_needed -= 1;
            if self.op_checks_needed == 0 {
                self.state = state;
            }
        }
        self.state
    }

    fn read_state(&mut self) -> u8 {
        self.state
    }

    fn sdo_read(
        &mut self,
        slave: u16,
        index: u16,
        sub: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> (i32, usize) {
        let Some(s) = self.slave_state(slave) else {
            return (0, 0);
        };
        if !s.cfg.coe || s.cfg.sdo_fail {
            return (0, 0);
        }
        match (index, sub) {
            (SM_COMM_TYPE, 0) => put(buf, &[4u8]),
            (SM_COMM_TYPE, n) if (1..=4).contains(&n) => {
                put(buf, &[s.comm_type(n as usize - 1)])
            }
            (PDO_ASSIGN_OUTPUTS, 0) => put(buf, &(s.cfg.rx_pdos.len() as u16).to_le_bytes()),
            (PDO_ASSIGN_OUTPUTS, n) => match s.cfg.rx_pdos.get(n as usize - 1) {
                Some(p) => put(buf, &p.index.to_le_bytes()),
                None => (0, 0),
            },
            (PDO_ASSIGN_INPUTS, 0) => put(buf, &(s.cfg.tx_pdos.len() as u16).to_le_bytes()),
            (PDO_ASSIGN_INPUTS, n) => match s.cfg.tx_pdos.get(n as usize - 1) {
                Some(p) => put(buf, &p.index.to_le_bytes()),
                None => (0, 0),
            },
            // Objects written over the mailbox read back verbatim.
            (index, sub) if s.od_store.contains_key(&(index, sub)) => {
                put(buf, &s.od_store[&(index, sub)])
            }
            (pdo_index, 0) => match s.find_pdo(pdo_index) {
                Some(p) => put(buf, &[p.entries.len() as u8]),
                None => (0, 0),
            },
            (pdo_index, n) => match s
                .find_pdo(pdo_index)
                .and_then(|p| p.entries.get(n as usize - 1))
            {
                Some(e) => {
                    let word = ((e.object as u32) << 16)
                        | ((e.sub as u32) << 8)
                        | e.bit_len as u32;
                    put(buf, &word.to_le_bytes())
                }
                None => (0, 0),
            },
        }
    }

    fn sdo_write(
        &mut self,
        slave: u16,
        index: u16,
        sub: u8,
        bytes: &[u8],
        _timeout: Duration,
    ) -> i32 {
        let Some(s) = self.slave_state_mut(slave) else {
            return 0;
        };
        if !s.cfg.coe || s.cfg.sdo_fail {
            return 0;
        }
        s.od_store.insert((index, sub), bytes.to_vec());
        1
    }

    fn od_entry_name(&mut self, slave: u16, index: u16, sub: u8) -> Option<String> {
        let s = self.slave_state(slave)?;
        s.cfg
            .rx_pdos
            .iter()
            .chain(s.cfg.tx_pdos.iter())
            .flat_map(|p| p.entries.iter())
            .find(|e| e.object == index && e.sub == sub)
            .and_then(|e| e.name.clone())
    }

    fn sii_find(&mut self, slave: u16, category: u16) -> Option<u16> {
        self.slave_state(slave)?.categories.get(&category).copied()
    }

    fn sii_byte(&mut self, slave: u16, addr: u16) -> Option<u8> {
        self.slave_state(slave)?.eeprom.get(addr as usize).copied()
    }

    fn sii_string(&mut self, slave: u16, index: u8) -> Option<String> {
        if index == 0 {
            return None;
        }
        self.slave_state(slave)?
            .strings
            .get(index as usize - 1)
            .cloned()
    }

    fn exchange(&mut self, _timeout: Duration) -> i32 {
        if !self.mapped {
            return 0;
        }
        // Loop every slave's outputs back onto its inputs.
        for s in &self.slaves {
            let n = s.input_bytes.min(s.output_bytes);
            self.input_image[s.input_base..s.input_base + n]
                .copy_from_slice(&self.output_image[s.output_base..s.output_base + n]);
        }
        self.wkc_override.unwrap_or_else(|| self.expected_wkc())
    }

    fn input_image(&self, slave: u16) -> &[u8] {
        if slave == 0 {
            return &self.input_image;
        }
        match self.slave_state(slave) {
            Some(s) => &self.input_image[s.input_base..s.input_base + s.input_bytes],
            None => &[],
        }
    }

    fn output_image(&self, slave: u16) -> &[u8] {
        if slave == 0 {
            return &self.output_image;
        }
        match self.slave_state(slave) {
            Some(s) => &self.output_image[s.output_base..s.output_base + s.output_bytes],
            None => &[],
        }
    }

    fn output_image_mut(&mut self, slave: u16) -> &mut [u8] {
        if slave == 0 {
            return &mut self.output_image;
        }
        let (base, len) = match self.slave_state(slave) {
            Some(s) => (s.output_base, s.output_bytes),
            None => (0, 0),
        };
        &mut self.output_image[base..base + len]
    }

    fn next_error(&mut self) -> Option<String> {
        self.errors.pop_front()
    }

    fn close(&mut self) {
        self.initialized = false;
        self.mapped = false;
        self.state = AlState::Init.as_u8();
        self.requested = self.state;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{RETURN_TIMEOUT, SDO_TIMEOUT};

    #[test]
    fn demo_bus_enumerates_and_maps() {
        let mut stack = SimStack::demo();
        stack.init("sim").unwrap();
        assert_eq!(stack.config_init().unwrap(), 2);
        assert_eq!(stack.read_state(), AlState::PreOp.as_u8());

        let total = stack.config_map().unwrap();
        assert_eq!(stack.read_state(), AlState::SafeOp.as_u8());
        // Servo: 6 bytes each way; I/O block: 1 byte each way.
        assert_eq!(stack.slave_io_bytes(1), (6, 6));
        assert_eq!(stack.slave_io_bytes(2), (1, 1));
        assert_eq!(stack.input_image(0).len(), 7);
        assert_eq!(stack.output_image(0).len(), 7);
        assert_eq!(total, 14);
        // Both slaves carry both directions: 2 * 2 + 2.
        assert_eq!(stack.expected_wkc(), 6);
    }

    #[test]
    fn init_rejects_empty_interface() {
        let mut stack = SimStack::demo();
        assert!(matches!(
            stack.init(""),
            Err(StackError::InterfaceOpen { .. })
        ));
    }

    #[test]
    fn sdo_table_serves_the_mapping_objects() {
        let mut stack = SimStack::demo();
        stack.init("sim").unwrap();
        stack.config_init().unwrap();

        let mut b1 = [0u8; 1];
        assert_eq!(stack.sdo_read(1, SM_COMM_TYPE, 0, &mut b1, SDO_TIMEOUT), (1, 1));
        assert_eq!(b1[0], 4);
        stack.sdo_read(1, SM_COMM_TYPE, 3, &mut b1, SDO_TIMEOUT);
        assert_eq!(b1[0], SM_TYPE_OUTPUTS);
        stack.sdo_read(1, SM_COMM_TYPE, 4, &mut b1, SDO_TIMEOUT);
        assert_eq!(b1[0], SM_TYPE_INPUTS);

        let mut b2 = [0u8; 2];
        stack.sdo_read(1, PDO_ASSIGN_OUTPUTS, 0, &mut b2, SDO_TIMEOUT);
        assert_eq!(u16::from_le_bytes(b2), 1);
        stack.sdo_read(1, PDO_ASSIGN_OUTPUTS, 1, &mut b2, SDO_TIMEOUT);
        assert_eq!(u16::from_le_bytes(b2), 0x1600);

        let mut b4 = [0u8; 4];
        stack.sdo_read(1, 0x1600, 1, &mut b4, SDO_TIMEOUT);
        assert_eq!(u32::from_le_bytes(b4), 0x6040_0010);

        // The EEPROM-only slave answers nothing over CoE.
        assert_eq!(stack.sdo_read(2, SM_COMM_TYPE, 0, &mut b1, SDO_TIMEOUT), (0, 0));
    }

    #[test]
    fn sdo_writes_read_back_over_the_mailbox() {
        let mut stack = SimStack::demo();
        stack.init("sim").unwrap();
        stack.config_init().unwrap();

        // Drive setup: mode of operation and the interpolation period.
        assert_eq!(stack.sdo_write(1, 0x6060, 0, &[8], SDO_TIMEOUT), 1);
        assert_eq!(stack.sdo_write(1, 0x60C2, 1, &[2], SDO_TIMEOUT), 1);

        let mut b1 = [0u8; 1];
        assert_eq!(stack.sdo_read(1, 0x6060, 0, &mut b1, SDO_TIMEOUT), (1, 1));
        assert_eq!(b1[0], 8);
        stack.sdo_read(1, 0x60C2, 1, &mut b1, SDO_TIMEOUT);
        assert_eq!(b1[0], 2);

        // The EEPROM-only slave refuses downloads like uploads.
        assert_eq!(stack.sdo_write(2, 0x6060, 0, &[8], SDO_TIMEOUT), 0);
    }

    #[test]
    fn quirky_firmware_shifts_reported_sm_types() {
        let mut slave = SimSlave {
            name: "quirky".to_string(),
            coe: true,
            rx_pdos: vec![SimPdo::new(
                0x1600,
                2,
                vec![SimPdoEntry::new(0x6040, 0, 16, "Controlword")],
            )],
            ..Default::default()
        };
        slave.sm2_reports_inputs = true;
        let mut stack = SimStack::new(vec![slave]);
        stack.init("sim").unwrap();
        stack.config_init().unwrap();

        let mut b1 = [0u8; 1];
        stack.sdo_read(1, SM_COMM_TYPE, 3, &mut b1, SDO_TIMEOUT);
        assert_eq!(b1[0], 2);
        stack.sdo_read(1, SM_COMM_TYPE, 4, &mut b1, SDO_TIMEOUT);
        assert_eq!(b1[0], 3);
    }

    #[test]
    fn eeprom_categories_are_walkable() {
        let mut stack = SimStack::demo();
        stack.init("sim").unwrap();
        stack.config_init().unwrap();

        // I/O block (slave 2) publishes its single output over the EEPROM.
        let addr = stack.sii_find(2, SII_CAT_RXPDO).unwrap();
        let lo = stack.sii_byte(2, addr).unwrap();
        let hi = stack.sii_byte(2, addr + 1).unwrap();
        // One 8-byte PDO header plus one 8-byte entry = 8 words.
        assert_eq!(u16::from_le_bytes([lo, hi]), 8);

        let idx_lo = stack.sii_byte(2, addr + 2).unwrap();
        let idx_hi = stack.sii_byte(2, addr + 3).unwrap();
        assert_eq!(u16::from_le_bytes([idx_lo, idx_hi]), 0x1601);
        let name_idx = stack.sii_byte(2, addr + 13).unwrap();
        assert_eq!(
            stack.sii_string(2, name_idx).as_deref(),
            Some("Digital outputs")
        );
    }

    #[test]
    fn exchange_loops_outputs_to_inputs() {
        let mut stack = SimStack::demo();
        stack.init("sim").unwrap();
        stack.config_init().unwrap();
        stack.config_map().unwrap();

        stack.output_image_mut(1)[0] = 0xA5;
        stack.output_image_mut(2)[0] = 0x3C;
        assert_eq!(stack.exchange(RETURN_TIMEOUT), 6);
        assert_eq!(stack.input_image(1)[0], 0xA5);
        assert_eq!(stack.input_image(2)[0], 0x3C);

        stack.set_wkc_override(Some(2));
        assert_eq!(stack.exchange(RETURN_TIMEOUT), 2);
    }

    #[test]
    fn error_acknowledge_clears_the_flag() {
        let mut stack = SimStack::demo();
        stack.init("sim").unwrap();
        stack.config_init().unwrap();
        stack.config_map().unwrap();

        let flagged = AlState::SafeOp.as_u8() | AL_ERROR_FLAG;
        stack.force_state(flagged);
        assert_eq!(stack.read_state(), flagged);

        // Writing the flagged state back acknowledges the error.
        stack.request_state(0, flagged);
        assert_eq!(stack.read_state(), AlState::SafeOp.as_u8());
    }

    #[test]
    fn op_is_gated_by_configured_check_count() {
        let mut stack = SimStack::demo();
        stack.init("sim").unwrap();
        stack.config_init().unwrap();
        stack.config_map().unwrap();
        stack.set_op_checks_needed(2);

        let op = AlState::Op.as_u8();
        stack.request_state(0, op);
        assert_eq!(stack.read_state(), AlState::SafeOp.as_u8());
        assert_eq!(stack.check_state(0, op, SDO_TIMEOUT), AlState::SafeOp.as_u8());
        assert_eq!(stack.check_state(0, op, SDO_TIMEOUT), op);
    }
}
