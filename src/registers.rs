//! The registers of the ventilation unit this bridge cares about.
//!
//! Registers are grouped into four tables. Every table shares a single access kind so that it
//! can be read out with one request when its addresses happen to be contiguous. Addresses here
//! are the 1-based ones used in the vendor documentation; the wire protocol is 0-based.

/// Holding register storing the active fan mode as an index into [`FanMode`].
pub const FAN_MODE_REGISTER: u16 = 5001;
/// Holding register storing the temperature setpoint in whole degrees.
pub const TEMPERATURE_SETPOINT_REGISTER: u16 = 5101;

/// How a register is read out from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    /// Read/write holding register, function code 3.
    Holding,
    /// Read-only input register, function code 4.
    Input,
}

impl AccessKind {
    pub const fn function_code(self) -> u8 {
        match self {
            AccessKind::Holding => 3,
            AccessKind::Input => 4,
        }
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, AccessKind::Holding)
    }
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AccessKind::Holding => "RW",
            AccessKind::Input => "R-",
        })
    }
}

/// The fan modes the unit can be asked to run in.
///
/// The discriminant is the value stored in [`FAN_MODE_REGISTER`].
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::FromRepr,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::VariantNames,
)]
#[repr(u8)]
pub enum FanMode {
    Stopped = 0,
    Away = 1,
    Home = 2,
    Boost = 3,
    Travelling = 4,
}

impl FanMode {
    /// The labels in register order.
    pub fn labels() -> &'static [&'static str] {
        <Self as strum::VariantNames>::VARIANTS
    }

    pub fn label(self) -> &'static str {
        self.into()
    }

    /// Interpret a decoded register value, `None` if it is outside of the known modes.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Integer(n) => u8::try_from(n).ok().and_then(Self::from_repr),
            Value::Decimal(_) => None,
        }
    }
}

/// A decoded register value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// Registers without decimals.
    Integer(i32),
    /// Registers with a fixed-point scale, already divided out.
    Decimal(f64),
}

impl Value {
    /// Decode a raw register word as read from the device.
    pub fn decode(raw: u16, decimals: u8) -> Self {
        Self::scaled(decode_signed(raw), decimals)
    }

    /// Apply the fixed-point scale of a register to an already signed value.
    pub fn scaled(signed: i32, decimals: u8) -> Self {
        if decimals == 0 {
            return Value::Integer(signed);
        }
        let factor = 10f64.powi(i32::from(decimals));
        Value::Decimal(((f64::from(signed) / factor) * factor).round() / factor)
    }

    /// Whether the value counts as set, as for alarm flags.
    pub fn is_active(self) -> bool {
        match self {
            Value::Integer(n) => n != 0,
            Value::Decimal(n) => n != 0.0,
        }
    }
}

/// Reinterpret an unsigned register word as a signed quantity.
///
/// Only values strictly greater than 32768 wrap around. 32768 itself is left alone, as the
/// device firmware never produces it for a signed register and the readings published so far
/// have always treated it as positive.
pub fn decode_signed(raw: u16) -> i32 {
    let raw = i32::from(raw);
    if raw > 32768 { raw - 65536 } else { raw }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::Integer(n) => f.write_fmt(format_args!("{}", n)),
            Value::Decimal(n) => f.write_fmt(format_args!("{:?}", n)),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Integer(n) => serializer.serialize_i32(n),
            Value::Decimal(n) => serializer.serialize_f64(n),
        }
    }
}

/// Static description of a register.
#[derive(Clone, Copy, Debug)]
pub struct RegisterDefinition {
    pub address: u16,
    pub access: AccessKind,
    pub name: &'static str,
    pub decimals: u8,
    /// Value assumed before the first read, in the register's signed but unscaled form.
    pub default: i16,
}

/// A register along with the most recent value read from the device.
#[derive(Clone, Debug)]
pub struct RegisterEntry {
    pub address: u16,
    pub access: AccessKind,
    pub name: &'static str,
    pub decimals: u8,
    pub last_raw: u16,
    pub last_value: Value,
}

impl From<&RegisterDefinition> for RegisterEntry {
    fn from(def: &RegisterDefinition) -> Self {
        Self {
            address: def.address,
            access: def.access,
            name: def.name,
            decimals: def.decimals,
            last_raw: def.default as u16,
            last_value: Value::scaled(i32::from(def.default), def.decimals),
        }
    }
}

impl RegisterEntry {
    /// Record a freshly read raw word.
    ///
    /// Returns the new value if it differs from the previously known one.
    pub fn record(&mut self, raw: u16) -> Option<Value> {
        let value = Value::decode(raw, self.decimals);
        self.last_raw = raw;
        if value == self.last_value {
            return None;
        }
        self.last_value = value;
        Some(value)
    }
}

/// Which of the four tables a register belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TableKind {
    Status,
    Sensors,
    Alarms,
    Settings,
}

/// An ordered group of registers sharing one access kind.
#[derive(Clone, Debug)]
pub struct RegisterTable {
    kind: TableKind,
    entries: Vec<RegisterEntry>,
}

impl RegisterTable {
    pub fn new(kind: TableKind, definitions: &[RegisterDefinition]) -> Self {
        Self { kind, entries: definitions.iter().map(RegisterEntry::from).collect() }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn entries(&self) -> &[RegisterEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [RegisterEntry] {
        &mut self.entries
    }

    pub fn access(&self) -> AccessKind {
        self.entries[0].access
    }

    pub fn first_address(&self) -> u16 {
        self.entries[0].address
    }

    /// Number of addresses between the first and the last register, inclusive.
    pub fn span(&self) -> u16 {
        let last = self.entries[self.entries.len() - 1].address;
        last - self.first_address() + 1
    }

    /// Whether the whole table can be read out with a single request.
    pub fn is_contiguous(&self) -> bool {
        usize::from(self.span()) == self.entries.len()
    }

    pub fn get(&self, name: &str) -> Option<&RegisterEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn value_of(&self, name: &str) -> Option<Value> {
        self.get(name).map(|e| e.last_value)
    }
}

/// All four tables, as read together in one cycle.
#[derive(Clone, Debug)]
pub struct Tables {
    pub status: RegisterTable,
    pub sensors: RegisterTable,
    pub alarms: RegisterTable,
    pub settings: RegisterTable,
}

impl Tables {
    pub fn from_catalog() -> Self {
        Self {
            status: RegisterTable::new(TableKind::Status, &STATUS),
            sensors: RegisterTable::new(TableKind::Sensors, &SENSORS),
            alarms: RegisterTable::new(TableKind::Alarms, &ALARMS),
            settings: RegisterTable::new(TableKind::Settings, &SETTINGS),
        }
    }

    /// The tables in the order they are read out.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterTable> {
        [&self.status, &self.sensors, &self.alarms, &self.settings].into_iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegisterTable> {
        [&mut self.status, &mut self.sensors, &mut self.alarms, &mut self.settings].into_iter()
    }
}

macro_rules! table {
    ($($address: literal: $access: ident, $name: literal, decimals = $decimals: literal, default = $default: literal;)+) => {
        [$(RegisterDefinition {
            address: $address,
            access: AccessKind::$access,
            name: $name,
            decimals: $decimals,
            default: $default,
        },)+]
    };
}

pub static STATUS: [RegisterDefinition; 1] = table! {
    5001: Holding, "Operating Mode", decimals = 0, default = 2;
};

pub static SENSORS: [RegisterDefinition; 14] = table! {
    6201: Input, "Fresh Air Temperature", decimals = 1, default = -550;
    6202: Input, "Supply air before re-heater temperature", decimals = 1, default = -550;
    6203: Input, "Supply air temperature", decimals = 1, default = -550;
    6204: Input, "Extract air temperature", decimals = 1, default = -550;
    6205: Input, "Exhaust (waste) air temperature", decimals = 1, default = -550;
    6206: Input, "Room air temperature", decimals = 1, default = -550;
    6207: Input, "User Panel 1 temperature", decimals = 1, default = -550;
    6208: Input, "User Panel 2 temperature", decimals = 1, default = -550;
    6209: Input, "Water Radiator temperature", decimals = 1, default = -550;
    6210: Input, "Pre-heater temperature", decimals = 1, default = -550;
    6211: Input, "External Fresh air temperature", decimals = 1, default = -550;
    6212: Input, "CO2 Unfiltered", decimals = 0, default = 0;
    6213: Input, "CO2 Filtered", decimals = 0, default = 0;
    6214: Input, "RH", decimals = 0, default = 0;
};

pub static ALARMS: [RegisterDefinition; 1] = table! {
    6132: Input, "Active Alarms", decimals = 0, default = 0;
};

pub static SETTINGS: [RegisterDefinition; 1] = table! {
    5101: Holding, "Temperature setpoint", decimals = 0, default = 23;
};

const fn assert_table(table: &[RegisterDefinition]) {
    assert!(!table.is_empty(), "register tables must not be empty");
    let mut index = 1;
    while index < table.len() {
        if table[index].address <= table[index - 1].address {
            panic!("register table is not sorted (or has duplicate addresses)!");
        }
        if table[index].access as u8 != table[0].access as u8 {
            panic!("register table mixes access kinds!");
        }
        index += 1;
    }
}

const _: () = assert_table(&STATUS);
const _: () = assert_table(&SENSORS);
const _: () = assert_table(&ALARMS);
const _: () = assert_table(&SETTINGS);

/// Every register in the catalog together with the table it lives in.
pub fn all_registers() -> impl Iterator<Item = (TableKind, &'static RegisterDefinition)> {
    let tables: [(TableKind, &'static [RegisterDefinition]); 4] = [
        (TableKind::Status, &STATUS),
        (TableKind::Sensors, &SENSORS),
        (TableKind::Alarms, &ALARMS),
        (TableKind::Settings, &SETTINGS),
    ];
    tables.into_iter().flat_map(|(kind, defs)| defs.iter().map(move |d| (kind, d)))
}
