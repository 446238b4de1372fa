//! Simulated serial device
//!
//! A scriptable stand-in for hardware that plugs into the transport as a
//! [`SerialLink`]. Each write is matched against response rules (checked by
//! priority, first match wins) and the chosen action queues reply bytes,
//! optionally after a delay. A built-in register bank answers Modbus RTU
//! reads and writes.

use crate::core::protocol::checksum;
use crate::core::protocol::modbus::FunctionCode;
use crate::core::transport::SerialLink;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Response rule condition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatchCondition {
    /// Match exact bytes
    Exact { bytes: Vec<u8> },
    /// Match text (substring)
    Text { text: String, case_sensitive: bool },
    /// Match regex
    Regex { pattern: String },
    /// Well-formed Modbus RTU request for this slave
    Modbus { slave_id: u8 },
    /// Match any input
    Any,
}

impl MatchCondition {
    /// Case-insensitive substring match
    pub fn text(text: &str) -> Self {
        Self::Text {
            text: text.to_string(),
            case_sensitive: false,
        }
    }

    /// Check if data matches this condition
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            Self::Exact { bytes } => data == bytes.as_slice(),
            Self::Text { text, case_sensitive } => {
                let data_str = String::from_utf8_lossy(data);
                if *case_sensitive {
                    data_str.contains(text.as_str())
                } else {
                    data_str.to_lowercase().contains(&text.to_lowercase())
                }
            }
            Self::Regex { pattern } => match Regex::new(pattern) {
                Ok(re) => re.is_match(&String::from_utf8_lossy(data)),
                Err(_) => false,
            },
            Self::Modbus { slave_id } => {
                data.len() >= 8 && data[0] == *slave_id && checksum::verify_crc16(data).is_ok()
            }
            Self::Any => true,
        }
    }
}

/// Response action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseAction {
    /// Send fixed bytes
    Send { data: Vec<u8> },
    /// Send hex string
    SendHex { hex: String },
    /// Send text
    SendText { text: String },
    /// Echo input back
    Echo,
    /// Hold back everything queued after this point
    Delay { ms: u64 },
    /// Execute multiple actions in sequence
    Sequence(Vec<ResponseAction>),
    /// Answer from the device register bank
    ModbusSlave,
    /// No response
    None,
}

/// Response rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Rule name
    pub name: String,
    /// Match condition
    pub condition: MatchCondition,
    /// Response action
    pub action: ResponseAction,
    /// Priority (higher = checked first)
    pub priority: i32,
    /// One-shot (disable after first match)
    #[serde(default)]
    pub one_shot: bool,
    /// Match count
    #[serde(default)]
    pub match_count: u64,
}

impl ResponseRule {
    /// Create a rule
    pub fn new(name: &str, condition: MatchCondition, action: ResponseAction) -> Self {
        Self {
            name: name.to_string(),
            condition,
            action,
            priority: 0,
            one_shot: false,
            match_count: 0,
        }
    }

    /// Set priority
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Disable after the first match
    #[must_use]
    pub fn once(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// Create a simple echo rule
    pub fn echo(name: &str) -> Self {
        Self::new(name, MatchCondition::Any, ResponseAction::Echo)
    }

    /// Reply `response` to any input containing `text` (case-insensitive)
    pub fn reply(name: &str, text: &str, response: &str) -> Self {
        Self::new(
            name,
            MatchCondition::text(text),
            ResponseAction::SendText {
                text: response.to_string(),
            },
        )
    }
}

/// Holding/input registers of a simulated Modbus slave, shared with the test
/// or tool that created the device
pub type RegisterBank = Arc<Mutex<BTreeMap<u16, u16>>>;

/// Reply bytes not yet visible to the reader
struct Queued {
    ready_at: Instant,
    data: Vec<u8>,
}

/// Simulated device
pub struct SimulatedDevice {
    name: String,
    rules: Vec<ResponseRule>,
    slave_id: u8,
    registers: RegisterBank,
    written: Arc<Mutex<Vec<u8>>>,
    outbox: VecDeque<Queued>,
    open: bool,
}

impl SimulatedDevice {
    /// Create a device with no rules; it stays silent
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
            slave_id: 1,
            registers: Arc::new(Mutex::new(BTreeMap::new())),
            written: Arc::new(Mutex::new(Vec::new())),
            outbox: VecDeque::new(),
            open: true,
        }
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a response rule
    pub fn add_rule(&mut self, rule: ResponseRule) {
        self.rules.push(rule);
        // Sort by priority (descending); stable, so insertion order breaks ties
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Add a rule, builder style
    #[must_use]
    pub fn with_rule(mut self, rule: ResponseRule) -> Self {
        self.add_rule(rule);
        self
    }

    /// Get all rules
    pub fn rules(&self) -> &[ResponseRule] {
        &self.rules
    }

    /// Answer Modbus requests for `slave_id` from the register bank
    #[must_use]
    pub fn with_modbus_slave(mut self, slave_id: u8, registers: &[(u16, u16)]) -> Self {
        self.slave_id = slave_id;
        self.registers.lock().extend(registers.iter().copied());
        self.add_rule(
            ResponseRule::new(
                "modbus",
                MatchCondition::Modbus { slave_id },
                ResponseAction::ModbusSlave,
            )
            .priority(100),
        );
        self
    }

    /// Shared view of the register bank
    pub fn registers(&self) -> RegisterBank {
        self.registers.clone()
    }

    /// Shared log of every byte written to the device
    pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        self.written.clone()
    }

    /// Run the rules against one write
    fn respond(&mut self, input: &[u8]) {
        let now = Instant::now();
        let mut ready_at = now;
        let mut replies = Vec::new();

        let Some(rule) = self
            .rules
            .iter_mut()
            .find(|r| !(r.one_shot && r.match_count > 0) && r.condition.matches(input))
        else {
            trace!("{}: no rule for {}", self.name, hex::encode(input));
            return;
        };
        rule.match_count += 1;
        debug!("{}: rule '{}' matched", self.name, rule.name);

        let action = rule.action.clone();
        self.apply(&action, input, &mut ready_at, &mut replies);
        for data in replies {
            if !data.is_empty() {
                self.outbox.push_back(Queued { ready_at, data });
            }
        }
    }

    fn apply(&self, action: &ResponseAction, input: &[u8], ready_at: &mut Instant, out: &mut Vec<Vec<u8>>) {
        match action {
            ResponseAction::Send { data } => out.push(data.clone()),
            ResponseAction::SendHex { hex } => {
                if let Ok(data) = hex::decode(hex.replace(' ', "")) {
                    out.push(data);
                }
            }
            ResponseAction::SendText { text } => out.push(text.as_bytes().to_vec()),
            ResponseAction::Echo => out.push(input.to_vec()),
            ResponseAction::Delay { ms } => *ready_at += Duration::from_millis(*ms),
            ResponseAction::Sequence(actions) => {
                for action in actions {
                    self.apply(action, input, ready_at, out);
                }
            }
            ResponseAction::ModbusSlave => out.push(self.modbus_reply(input)),
            ResponseAction::None => {}
        }
    }

    fn modbus_reply(&self, request: &[u8]) -> Vec<u8> {
        let slave = request[0];
        let function = request[1];
        let field = |at: usize| u16::from_be_bytes([request[at], request[at + 1]]);
        let address = field(2);
        let mut registers = self.registers.lock();

        let mut reply = match FunctionCode::from_u8(function) {
            Some(FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters) => {
                let count = field(4);
                let values: Option<Vec<u16>> = (0..count)
                    .map(|i| registers.get(&address.wrapping_add(i)).copied())
                    .collect();
                match values {
                    Some(values) => {
                        let mut reply = vec![slave, function, (values.len() * 2) as u8];
                        for v in values {
                            reply.extend_from_slice(&v.to_be_bytes());
                        }
                        reply
                    }
                    None => vec![slave, function | 0x80, 0x02],
                }
            }
            Some(FunctionCode::WriteSingleRegister) => {
                registers.insert(address, field(4));
                request[..6].to_vec()
            }
            Some(FunctionCode::WriteMultipleRegisters) if request.len() >= 9 => {
                let count = field(4);
                let byte_count = usize::from(request[6]);
                if byte_count != usize::from(count) * 2 || request.len() < 9 + byte_count {
                    vec![slave, function | 0x80, 0x03]
                } else {
                    for i in 0..count {
                        registers.insert(address.wrapping_add(i), field(7 + usize::from(i) * 2));
                    }
                    request[..6].to_vec()
                }
            }
            _ => vec![slave, function | 0x80, 0x01],
        };
        checksum::append_crc16(&mut reply);
        reply
    }
}

impl SerialLink for SimulatedDevice {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        self.written.lock().extend_from_slice(data);
        self.respond(data);
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        let deadline = Instant::now() + timeout;
        let Some(front) = self.outbox.front_mut() else {
            std::thread::sleep(timeout);
            return Ok(0);
        };
        if front.ready_at > deadline {
            std::thread::sleep(timeout);
            return Ok(0);
        }
        let wait = front.ready_at.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }

        let n = front.data.len().min(buf.len());
        buf[..n].copy_from_slice(&front.data[..n]);
        front.data.drain(..n);
        if front.data.is_empty() {
            self.outbox.pop_front();
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        // Only drop replies that have already "arrived"
        let now = Instant::now();
        self.outbox.retain(|q| q.ready_at > now);
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.outbox.clear();
    }
}

/// Preset device templates
pub struct DeviceTemplates;

impl DeviceTemplates {
    /// Simple echo device
    pub fn echo() -> SimulatedDevice {
        SimulatedDevice::new("Echo Device").with_rule(ResponseRule::echo("echo_all"))
    }

    /// AT command responder
    pub fn at_modem() -> SimulatedDevice {
        SimulatedDevice::new("AT Modem")
            .with_rule(ResponseRule::reply("AT", "AT\r", "OK\r\n").priority(10))
            .with_rule(ResponseRule::reply("ATI", "ATI\r", "Rigcon Virtual Modem v1.0\r\nOK\r\n").priority(10))
            .with_rule(ResponseRule::reply("CSQ", "AT+CSQ", "+CSQ: 23,99\r\nOK\r\n").priority(10))
            .with_rule(ResponseRule::reply("GMR", "AT+GMR", "FW 2.4.1\r\nOK\r\n").priority(10))
            .with_rule(ResponseRule::reply("unknown", "AT", "ERROR\r\n").priority(1))
    }

    /// Modbus RTU slave with ten zeroed holding registers
    pub fn modbus_slave(slave_id: u8) -> SimulatedDevice {
        let registers: Vec<(u16, u16)> = (0..10).map(|a| (a, 0)).collect();
        SimulatedDevice::new(&format!("Modbus Slave {slave_id}")).with_modbus_slave(slave_id, &registers)
    }

    /// AT modem that also answers Modbus slave 1
    pub fn bench_device() -> SimulatedDevice {
        let registers: Vec<(u16, u16)> = (0..32).map(|a| (a, a * 10)).collect();
        let mut device = Self::at_modem().with_modbus_slave(1, &registers);
        device.name = "Bench Device".to_string();
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::modbus::{decode_response, encode_read_request, encode_write_request, ReplyBody};

    fn collect(device: &mut SimulatedDevice, timeout: Duration) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = device.read_some(&mut buf, timeout).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_echo_device() {
        let mut device = DeviceTemplates::echo();
        device.write_all(b"Hello").unwrap();
        assert_eq!(collect(&mut device, Duration::from_millis(20)), b"Hello");
    }

    #[test]
    fn test_at_modem() {
        let mut device = DeviceTemplates::at_modem();
        device.write_all(b"AT\r\n").unwrap();
        assert_eq!(collect(&mut device, Duration::from_millis(20)), b"OK\r\n");

        device.write_all(b"AT+FOO\r\n").unwrap();
        assert_eq!(collect(&mut device, Duration::from_millis(20)), b"ERROR\r\n");
    }

    #[test]
    fn test_delay_holds_reply_back() {
        let mut device = SimulatedDevice::new("slow").with_rule(ResponseRule::new(
            "slow",
            MatchCondition::Any,
            ResponseAction::Sequence(vec![
                ResponseAction::Delay { ms: 80 },
                ResponseAction::SendText { text: "late".into() },
            ]),
        ));
        device.write_all(b"x").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(device.read_some(&mut buf, Duration::from_millis(10)).unwrap(), 0);
        assert_eq!(collect(&mut device, Duration::from_millis(200)), b"late");
    }

    #[test]
    fn test_one_shot_rule() {
        let mut device = SimulatedDevice::new("once")
            .with_rule(ResponseRule::reply("first", "PING", "PONG").priority(5).once())
            .with_rule(ResponseRule::reply("later", "PING", "BUSY"));
        device.write_all(b"PING").unwrap();
        assert_eq!(collect(&mut device, Duration::from_millis(20)), b"PONG");
        device.write_all(b"PING").unwrap();
        assert_eq!(collect(&mut device, Duration::from_millis(20)), b"BUSY");
    }

    #[test]
    fn test_match_conditions() {
        let exact = MatchCondition::Exact { bytes: vec![0x01, 0x02, 0x03] };
        assert!(exact.matches(&[0x01, 0x02, 0x03]));
        assert!(!exact.matches(&[0x01, 0x02]));

        assert!(MatchCondition::text("hello").matches(b"Hello World"));

        let re = MatchCondition::Regex { pattern: r"^AT\+\w+=".into() };
        assert!(re.matches(b"AT+BAUD=9600\r\n"));
        assert!(!re.matches(b"ATI\r\n"));
    }

    #[test]
    fn test_modbus_slave_reads_and_writes() {
        let mut device = DeviceTemplates::modbus_slave(7);
        let bank = device.registers();

        device.write_all(&encode_write_request(7, 2, &[0x1234, 0x5678]).unwrap()).unwrap();
        let reply = collect(&mut device, Duration::from_millis(20));
        assert_eq!(
            decode_response(&reply, 7).unwrap().body,
            ReplyBody::WroteRegisters { address: 2, count: 2 }
        );
        assert_eq!(bank.lock().get(&3), Some(&0x5678));

        device
            .write_all(&encode_read_request(7, 2, 2, FunctionCode::ReadHoldingRegisters).unwrap())
            .unwrap();
        let reply = collect(&mut device, Duration::from_millis(20));
        assert_eq!(decode_response(&reply, 7).unwrap().registers(), Some(&[0x1234, 0x5678][..]));
    }

    #[test]
    fn test_modbus_slave_out_of_range_is_exception() {
        let mut device = DeviceTemplates::modbus_slave(1);
        device
            .write_all(&encode_read_request(1, 9, 4, FunctionCode::ReadInputRegisters).unwrap())
            .unwrap();
        let reply = collect(&mut device, Duration::from_millis(20));
        assert_eq!(decode_response(&reply, 1).unwrap().exception(), Some(0x02));
    }

    #[test]
    fn test_modbus_slave_ignores_other_slaves() {
        let mut device = DeviceTemplates::modbus_slave(1);
        device
            .write_all(&encode_read_request(2, 0, 1, FunctionCode::ReadHoldingRegisters).unwrap())
            .unwrap();
        assert!(collect(&mut device, Duration::from_millis(20)).is_empty());
    }

    #[test]
    fn test_closed_device_refuses_io() {
        let mut device = DeviceTemplates::echo();
        device.close();
        assert!(device.write_all(b"x").is_err());
    }
}
