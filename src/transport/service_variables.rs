use core::str;

use anyhow::Context;
use quick_xml::events::{BytesText, Event};
use serde::{Deserialize, Serialize};

use super::xml::{IntoXml, XmlWriter};

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    Ui1,
    Ui2,
    Ui4,
    Ui8,
    I1,
    I2,
    I4,
    I8,
    Int,
    R4,
    R8,
    Number,
    Float,
    Fixed14_4,
    Char,
    #[default]
    String,
    Date,
    DateTime,
    DateTimeTz,
    Time,
    TimeTz,
    Boolean,
    BinBase64,
    BinHex,
    Uri,
    Uuid,
}

fn parse_bool(str_val: &str) -> anyhow::Result<bool> {
    match str_val {
        "1" => Ok(true),
        "0" => Ok(false),
        "true" => Ok(true),
        "false" => Ok(false),
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(anyhow::anyhow!("Unknown boolean value: {str_val}")),
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Ui1 => "ui1",
            DataType::Ui2 => "ui2",
            DataType::Ui4 => "ui4",
            DataType::Ui8 => "ui8",
            DataType::I1 => "i1",
            DataType::I2 => "i2",
            DataType::I4 => "i4",
            DataType::I8 => "i8",
            DataType::Int => "int",
            DataType::R4 => "r4",
            DataType::R8 => "r8",
            DataType::Number => "number",
            DataType::Float => "float",
            DataType::Fixed14_4 => "fixed.14.4",
            DataType::Char => "char",
            DataType::String => "string",
            DataType::Date => "date",
            DataType::DateTime => "dateTime",
            DataType::DateTimeTz => "dateTime.tz",
            DataType::Time => "time",
            DataType::TimeTz => "time.tz",
            DataType::Boolean => "boolean",
            DataType::BinBase64 => "bin.base64",
            DataType::BinHex => "bin.hex",
            DataType::Uri => "uri",
            DataType::Uuid => "uuid",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ui1" => Ok(DataType::Ui1),
            "ui2" => Ok(DataType::Ui2),
            "ui4" => Ok(DataType::Ui4),
            "ui8" => Ok(DataType::Ui8),
            "i1" => Ok(DataType::I1),
            "i2" => Ok(DataType::I2),
            "i4" => Ok(DataType::I4),
            "int" => Ok(DataType::Int),
            "r4" => Ok(DataType::R4),
            "r8" => Ok(DataType::R8),
            "number" => Ok(DataType::Number),
            "float" => Ok(DataType::Float),
            "fixed14_4" => Ok(DataType::Fixed14_4),
            "char" => Ok(DataType::Char),
            "string" => Ok(DataType::String),
            "date" => Ok(DataType::Date),
            "dateTime" => Ok(DataType::DateTime),
            "dateTimeTz" => Ok(DataType::DateTimeTz),
            "time" => Ok(DataType::Time),
            "timeTz" => Ok(DataType::TimeTz),
            "boolean" => Ok(DataType::Boolean),
            "bin.base64" => Ok(DataType::BinBase64),
            "bin.hex" => Ok(DataType::BinHex),
            "uri" => Ok(DataType::Uri),
            "uuid" => Ok(DataType::Uuid),
            data_type => Err(anyhow::anyhow!("unrecognized data type: {data_type}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub start: isize,
    pub end: isize,
    pub step: Option<isize>,
}

/// Convert types into upnp values
pub trait IntoUpnpValue: IntoXml {
    const TYPE_NAME: DataType = DataType::String;
    fn from_xml_value(value: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl IntoUpnpValue for u8 {
    const TYPE_NAME: DataType = DataType::Ui1;

    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse u8")
    }
}

impl IntoXml for u8 {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for u16 {
    const TYPE_NAME: DataType = DataType::Ui2;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse u8")
    }
}

impl IntoXml for u16 {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for u32 {
    const TYPE_NAME: DataType = DataType::Ui4;

    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse u32")
    }
}

impl IntoXml for u32 {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for u64 {
    const TYPE_NAME: DataType = DataType::Ui8;

    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse u64")
    }
}

impl IntoXml for u64 {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for i8 {
    const TYPE_NAME: DataType = DataType::I1;

    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse u8")
    }
}

impl IntoXml for i8 {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for i16 {
    const TYPE_NAME: DataType = DataType::I2;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse i16")
    }
}

impl IntoXml for i16 {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for i32 {
    const TYPE_NAME: DataType = DataType::I4;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse i32")
    }
}

impl IntoXml for i32 {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for i64 {
    const TYPE_NAME: DataType = DataType::I8;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse i64")
    }
}

impl IntoXml for i64 {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for bool {
    const TYPE_NAME: DataType = DataType::Boolean;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        parse_bool(value)
    }
}

impl IntoXml for bool {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let val = if *self { "1" } else { "0" };
        w.write_event(Event::Text(BytesText::new(val)))
    }
}

impl IntoUpnpValue for uuid::Uuid {
    const TYPE_NAME: DataType = DataType::Uuid;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse uuid")
    }
}

impl IntoXml for uuid::Uuid {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for String {
    const TYPE_NAME: DataType = DataType::String;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse string")
    }
}

impl IntoXml for String {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::new(self)))
    }
}

impl IntoUpnpValue for reqwest::Url {
    const TYPE_NAME: DataType = DataType::Uri;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse url")
    }
}

impl IntoXml for reqwest::Url {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let url = self.to_string();
        w.write_event(Event::Text(BytesText::new(&url)))
    }
}

impl IntoUpnpValue for std::net::Ipv4Addr {
    const TYPE_NAME: DataType = DataType::String;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse url")
    }
}

impl IntoXml for std::net::Ipv4Addr {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let url = self.to_string();
        w.write_event(Event::Text(BytesText::new(&url)))
    }
}

impl IntoXml for &str {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::new(self)))
    }
}

impl<T: IntoUpnpValue> IntoUpnpValue for Option<T> {
    fn from_xml_value(value: &str) -> anyhow::Result<Self>
    where
        Self: Sized,
    {
        if value.is_empty() {
            Ok(Self::None)
        } else {
            T::from_xml_value(value).map(Some)
        }
    }
}

impl<T: IntoXml> IntoXml for Option<T> {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        match self {
            Some(v) => v.write_xml(w),
            None => Ok(()),
        }
    }
}

/// A state variable read back from a fetched SCPD document. Only the read-side
/// fields the engine cares about (name and declared type) are kept; this crate
/// never serves a description of its own.
#[derive(Debug, Clone)]
pub struct StateVariableDescriptor {
    pub name: String,
    pub kind: DataType,
    pub send_events: bool,
}

/// A type-level description of one named UPnP state variable, e.g. `ExternalIPAddress`
/// on `WANIPConnection`. Used to validate argument order and to parse evented values.
pub trait SVariable: Sized {
    type VarType: IntoUpnpValue;

    const VAR_NAME: &'static str;
    const SEND_EVENTS: bool = false;
}
