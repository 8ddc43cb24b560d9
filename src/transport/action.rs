use core::str;
use std::{borrow::Cow, fmt::Display, str::FromStr};

use anyhow::Context;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{
    service::ArgumentScanner,
    service_variables::IntoUpnpValue,
    urn::URN,
    xml::{FromXml, IntoXml, XmlReaderExt, XmlWriter},
};

#[derive(Debug, Clone, Copy)]
pub enum ArgumentDirection {
    In,
    Out,
}

impl FromStr for ArgumentDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            _ => Err(anyhow::anyhow!("expected in or out, got {s}")),
        }
    }
}

impl From<ArgumentDirection> for &str {
    fn from(value: ArgumentDirection) -> Self {
        match value {
            ArgumentDirection::In => "in",
            ArgumentDirection::Out => "out",
        }
    }
}

#[derive(Debug)]
pub(crate) struct SoapMessage<T> {
    inner: T,
}

impl<T> SoapMessage<T> {
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<'a, T: FromXml<'a>> SoapMessage<T> {
    pub fn from_xml(raw_xml: &'a [u8]) -> anyhow::Result<Self> {
        use quick_xml::Reader;
        let mut r = Reader::from_reader(raw_xml);

        let envelope = r.read_to_start()?.into_owned();
        anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
        let body = r.read_to_start()?.into_owned();
        anyhow::ensure!(body.local_name().as_ref() == b"Body");

        let payload = T::read_xml(&mut r)?;

        r.read_to_end(body.name())?;
        r.read_to_end(envelope.name())?;
        Ok(Self { inner: payload })
    }
}

impl<'a, T: FromXml<'a>> FromXml<'a> for SoapMessage<T> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let envelope = r.read_to_start()?.into_owned();
        anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
        let body = r.read_to_start()?.into_owned();
        anyhow::ensure!(body.local_name().as_ref() == b"Body");

        let payload = T::read_xml(r)?;

        r.read_to_end(body.name())?;
        r.read_to_end(envelope.name())?;
        Ok(Self { inner: payload })
    }
}

/// Writes a SOAP action request directly into a buffer, a single argument at a time.
///
/// To produce an action response instead, the only change needed is an action
/// name with a `Response` suffix — this crate never does that since it is a
/// control point, not a device.
pub struct WritableAction {
    w: quick_xml::Writer<Vec<u8>>,
    action_name: String,
}

impl WritableAction {
    pub fn new(action_name: &str, urn: URN) -> quick_xml::Result<Self> {
        let mut w = quick_xml::Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let envelope = BytesStart::new("s:Envelope").with_attributes([
            ("xmlns:s", "http://schemas.xmlsoap.org/soap/envelope/"),
            (
                "s:encodingStyle",
                "http://schemas.xmlsoap.org/soap/encoding/",
            ),
        ]);
        w.write_event(Event::Start(envelope))?;
        let body = BytesStart::new("s:Body");
        w.write_event(Event::Start(body))?;

        let action_name = format!("u:{action_name}");
        let urn = urn.to_string();
        let action = BytesStart::new(&action_name).with_attributes([("xmlns:u", urn.as_str())]);
        w.write_event(Event::Start(action))?;

        Ok(Self { w, action_name })
    }

    pub fn write_argument<T: IntoXml>(&mut self, name: &str, argument: T) -> quick_xml::Result<()> {
        self.w
            .create_element(name)
            .write_inner_content(|w| argument.write_xml(w))?;
        Ok(())
    }

    /// Writes the end of the message and returns the SOAP raw request body.
    pub fn finish(mut self) -> quick_xml::Result<String> {
        self.w
            .write_event(Event::End(BytesEnd::new(self.action_name)))?;
        self.w.write_event(Event::End(BytesEnd::new("s:Body")))?;
        self.w
            .write_event(Event::End(BytesEnd::new("s:Envelope")))?;
        Ok(String::from_utf8(self.w.into_inner())?)
    }
}

#[derive(Debug, Clone)]
pub struct InArgumentPayload<'a> {
    pub name: String,
    pub value: Cow<'a, str>,
}

impl InArgumentPayload<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
pub struct ActionResponse<T> {
    pub action_name: String,
    pub service_urn: URN,
    pub args: Vec<T>,
}

impl<'a, 'b> ActionResponse<InArgumentPayload<'a>> {
    pub fn read_xml(
        r: &mut quick_xml::Reader<&'a [u8]>,
        urn: URN,
        action_tag_name: quick_xml::name::QName<'b>,
    ) -> anyhow::Result<Self> {
        let mut arguments = Vec::new();

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let name = String::from_utf8(start.local_name().as_ref().to_vec())?;
                    let value = r.read_text(start.name())?;
                    arguments.push(InArgumentPayload { name, value });
                }
                Event::End(end) if end.name() == action_tag_name => {
                    break;
                }
                Event::Text(_) => {}
                r => {
                    anyhow::bail!("expected action end, got {:?}", r);
                }
            }
        }

        let action_name = std::str::from_utf8(action_tag_name.into_inner())
            .context("convert action tag name to string")?;
        let action_name = action_name
            .strip_suffix("Response")
            .context("strip Response suffix")?
            .to_owned();

        Ok(Self {
            action_name,
            service_urn: urn,
            args: arguments,
        })
    }
}

pub trait ScannableArguments {
    fn scan_arguments(scanner: &mut ArgumentScanner) -> Result<Self, ActionError>
    where
        Self: Sized;
}

impl<T: IntoUpnpValue> ScannableArguments for T {
    fn scan_arguments(scanner: &mut ArgumentScanner) -> Result<Self, ActionError>
    where
        Self: Sized,
    {
        scanner.next_unchecked::<T>()
    }
}

impl ScannableArguments for () {
    fn scan_arguments(_scanner: &mut ArgumentScanner) -> Result<Self, ActionError> {
        Ok(())
    }
}

macro_rules! impl_tuples_scannable_argument {
    () => {};

    ($(($($types:ident),*)),*) => {
        $(
            #[allow(non_snake_case, unused_variables)]
            impl<$($types: IntoUpnpValue),*> ScannableArguments for ($($types,)*) {
                fn scan_arguments(scanner: &mut ArgumentScanner) -> Result<Self, ActionError> {
                    Ok(($(
                        scanner.next_unchecked::<$types>()?,
                    )*))
                }
            }
        )*
    };
}

impl_tuples_scannable_argument! {
    (A),
    (A, B),
    (A, B, C),
    (A, B, C, D),
    (A, B, C, D, E),
    (A, B, C, D, E, F),
    (A, B, C, D, E, F, G),
    (A, B, C, D, E, F, G, H),
    (A, B, C, D, E, F, G, H, I),
    (A, B, C, D, E, F, G, H, I, J),
    (A, B, C, D, E, F, G, H, I, J, K),
    (A, B, C, D, E, F, G, H, I, J, K, L)
}

impl<'a> FromXml<'a> for Result<ActionResponse<InArgumentPayload<'a>>, ActionError> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let start = r.read_to_start()?;
        match start.local_name().as_ref() {
            b"Fault" => Ok(Err(ActionError::read_xml(r, start.name())?)),
            other if other.ends_with(b"Response") => {
                let urn = start
                    .attributes()
                    .flatten()
                    .filter_map(|attr| attr.unescape_value().ok())
                    .find_map(|attr| attr.starts_with("urn").then(|| URN::from_str(&attr)));
                let urn = urn.context("urn attribute is not found")?;
                let urn = urn.context("failed to parse urn attribute")?;
                ActionResponse::read_xml(r, urn, start.name()).map(Ok)
            }
            r => Err(anyhow::anyhow!("expected fault or response, got {:?}", r)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ActionErrorCode {
    /// No action by that name at this service.
    InvalidAction,
    /// Could be any of the following: not enough in args, args in the wrong
    /// order, one or more in args are of the wrong data type.
    InvalidArguments,
    /// Is allowed to be returned if current state of service prevents invoking
    /// that action
    ActionFailed,
    /// The argument value is invalid
    ArgumentInvalid,
    /// An argument value is less than the minimum or more than the
    /// maximum value of the allowed value range, or is not in the allowed
    /// value list
    ArgumentValueOutOfRange,
    /// Optional Action Not Implemented
    OptionalActionNotImplemented,
    /// The device does not have sufficient memory available to complete the
    /// action.
    OutOfMemory,
    /// The device has encountered an error condition which it cannot resolve
    /// itself and required human intervention such as a reset or power cycle.
    HumanInterventionRequired,
    /// A string argument is too long for the device to handle properly.
    StringArgumentTooLong,
    /// Any other UPnPError code, most importantly 718 (ConflictInMappingEntry).
    Other(u16),
}

impl ActionErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ActionErrorCode::InvalidAction => 401,
            ActionErrorCode::InvalidArguments => 402,
            ActionErrorCode::ActionFailed => 501,
            ActionErrorCode::ArgumentInvalid => 600,
            ActionErrorCode::ArgumentValueOutOfRange => 601,
            ActionErrorCode::OptionalActionNotImplemented => 602,
            ActionErrorCode::OutOfMemory => 603,
            ActionErrorCode::HumanInterventionRequired => 604,
            ActionErrorCode::StringArgumentTooLong => 605,
            ActionErrorCode::Other(code) => *code,
        }
    }

    pub fn is_conflict_in_mapping_entry(&self) -> bool {
        self.code() == 718
    }
}

impl From<u16> for ActionErrorCode {
    fn from(value: u16) -> Self {
        match value {
            401 => ActionErrorCode::InvalidAction,
            402 => ActionErrorCode::InvalidArguments,
            501 => ActionErrorCode::ActionFailed,
            600 => ActionErrorCode::ArgumentInvalid,
            601 => ActionErrorCode::ArgumentValueOutOfRange,
            602 => ActionErrorCode::OptionalActionNotImplemented,
            603 => ActionErrorCode::OutOfMemory,
            604 => ActionErrorCode::HumanInterventionRequired,
            605 => ActionErrorCode::StringArgumentTooLong,
            _ => ActionErrorCode::Other(value),
        }
    }
}

impl From<ActionErrorCode> for ActionError {
    fn from(code: ActionErrorCode) -> Self {
        Self {
            code,
            description: None,
        }
    }
}

#[derive(Debug)]
pub struct ActionError {
    pub code: ActionErrorCode,
    pub description: Option<String>,
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            code: ActionErrorCode::ActionFailed,
            description: Some(err.to_string()),
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(description) = &self.description {
            write!(f, "{}: {}", self.code.code(), description)
        } else {
            write!(f, "{}", self.code.code())
        }
    }
}
impl std::error::Error for ActionError {}

impl ActionError {
    fn read_xml<'a, 'b>(
        r: &mut quick_xml::Reader<&'a [u8]>,
        end_tag: quick_xml::name::QName<'b>,
    ) -> anyhow::Result<Self> {
        let fault_code = r.read_to_start()?;
        anyhow::ensure!(fault_code.local_name().as_ref() == b"faultcode");
        r.read_to_end(fault_code.name())?;
        let fault_string = r.read_to_start()?;
        anyhow::ensure!(fault_string.local_name().as_ref() == b"faultstring");
        let fault_string_text = r.read_text(fault_string.name())?;
        anyhow::ensure!(fault_string_text == "UPnPError");
        let detail = r.read_to_start()?;
        anyhow::ensure!(detail.local_name().as_ref() == b"detail");
        let upnp_error = r.read_to_start()?;
        anyhow::ensure!(upnp_error.local_name().as_ref() == b"UPnPError");
        let error_code = r.read_to_start()?;
        anyhow::ensure!(error_code.local_name().as_ref() == b"errorCode");
        let code = r.read_text(error_code.name())?;
        let code: u16 = code.parse().context("parse error code")?;
        let mut description = None;

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    anyhow::ensure!(start.local_name().as_ref() == b"errorDescription");
                    description = Some(r.read_text(start.name())?.to_string());
                    r.read_to_end(upnp_error.name())?;
                    break;
                }
                Event::End(end) => {
                    anyhow::ensure!(end == upnp_error.to_end());
                    break;
                }
                Event::Text(_) => {}
                r => Err(anyhow::anyhow!(
                    "expected description or fault end, got {:?}",
                    r
                ))?,
            }
        }

        r.read_to_end(detail.name())?;
        r.read_to_end(end_tag)?;

        Ok(Self {
            code: code.into(),
            description,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_conflict_in_mapping_entry_fault() {
        let raw = br#"<?xml version="1.0"?>
<s:Envelope
xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<s:Fault>
<faultcode>s:Client</faultcode>
<faultstring>UPnPError</faultstring>
<detail>
<UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
<errorCode>718</errorCode>
<errorDescription>ConflictInMappingEntry</errorDescription>
</UPnPError>
</detail>
</s:Fault>
</s:Body>
</s:Envelope>"#;
        let payload: SoapMessage<Result<ActionResponse<InArgumentPayload>, ActionError>> =
            SoapMessage::from_xml(raw).unwrap();
        let err = payload.into_inner().unwrap_err();
        assert!(err.code.is_conflict_in_mapping_entry());
        assert_eq!(err.description.as_deref(), Some("ConflictInMappingEntry"));
    }
}
