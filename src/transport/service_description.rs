use anyhow::Context;
use quick_xml::events::Event;

use super::{
    action::ArgumentDirection,
    service_variables::{DataType, StateVariableDescriptor},
    xml::{FromXml, XmlReaderExt},
    SpecVersion,
};

/// One `<argument>` entry of an `<action>` inside a fetched SCPD document.
#[derive(Debug, Clone)]
pub struct ScpdArgument {
    pub name: String,
    pub direction: ArgumentDirection,
    pub related_state_variable: String,
}

impl<'a> FromXml<'a> for ScpdArgument {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let parent = r.read_to_start()?.into_owned();
        anyhow::ensure!(parent.local_name().as_ref() == b"argument");
        let parent_end = parent.to_end().into_owned();

        let mut name = None;
        let mut direction = None;
        let mut related_state_variable = None;

        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let start = start.into_owned();
                    let tag_name = start.name();
                    match start.local_name().as_ref() {
                        b"name" => name = Some(r.read_text(tag_name)?.to_string()),
                        b"direction" => {
                            direction = Some(r.read_text(tag_name)?.parse()?);
                        }
                        b"relatedStateVariable" => {
                            related_state_variable = Some(r.read_text(tag_name)?.to_string());
                        }
                        _ => {
                            r.read_to_end(tag_name)?;
                        }
                    }
                }
                Event::End(end) if end == parent_end => break,
                _ => {}
            }
        }

        Ok(Self {
            name: name.context("argument name")?,
            direction: direction.context("argument direction")?,
            related_state_variable: related_state_variable.context("related state variable")?,
        })
    }
}

/// One `<action>` entry of a fetched SCPD document.
#[derive(Debug, Clone)]
pub struct ScpdAction {
    pub name: String,
    pub arguments: Vec<ScpdArgument>,
}

impl<'a> FromXml<'a> for ScpdAction {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let parent = r.read_to_start()?.into_owned();
        anyhow::ensure!(parent.local_name().as_ref() == b"action");
        let parent_end = parent.to_end().into_owned();

        let mut name = None;
        let mut arguments = Vec::new();

        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => match start.local_name().as_ref() {
                    b"name" => {
                        name = Some(r.read_text(start.name())?.to_string());
                    }
                    b"argumentList" => {
                        let list_end = start.to_end().into_owned();
                        loop {
                            match r.read_event_err_eof()? {
                                Event::Start(arg_start)
                                    if arg_start.local_name().as_ref() == b"argument" =>
                                {
                                    arguments.push(ScpdArgument::read_xml(r)?);
                                }
                                Event::End(end) if end == list_end => break,
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                },
                Event::End(end) if end == parent_end => break,
                _ => {}
            }
        }

        Ok(Self {
            name: name.context("action name")?,
            arguments,
        })
    }
}

/// A parsed SCPD (Service Control Protocol Description) document: the action and
/// state-variable table a control point fetches once per discovered service and
/// uses to validate argument order before issuing a SOAP call.
#[derive(Debug, Clone)]
pub struct Scpd {
    pub spec_version: SpecVersion,
    pub actions: Vec<ScpdAction>,
    pub variables: Vec<StateVariableDescriptor>,
}

impl<'a> FromXml<'a> for Scpd {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let parent = r.read_to_start()?.into_owned();
        anyhow::ensure!(parent.local_name().as_ref() == b"scpd");
        let parent_end = parent.to_end().into_owned();

        let spec_version = SpecVersion::read_xml(r)?;

        let mut actions = Vec::new();
        let mut variables = Vec::new();

        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => match start.local_name().as_ref() {
                    b"actionList" => {
                        let list_end = start.to_end().into_owned();
                        loop {
                            match r.read_event_err_eof()? {
                                Event::Start(action_start)
                                    if action_start.local_name().as_ref() == b"action" =>
                                {
                                    actions.push(ScpdAction::read_xml(r)?);
                                }
                                Event::End(end) if end == list_end => break,
                                _ => {}
                            }
                        }
                    }
                    b"serviceStateTable" => {
                        let table_end = start.to_end().into_owned();
                        loop {
                            match r.read_event_err_eof()? {
                                Event::Start(var_start)
                                    if var_start.local_name().as_ref() == b"stateVariable" =>
                                {
                                    variables.push(read_state_variable(r, &var_start)?);
                                }
                                Event::End(end) if end == table_end => break,
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                },
                Event::End(end) if end == parent_end => break,
                _ => {}
            }
        }

        Ok(Self {
            spec_version,
            actions,
            variables,
        })
    }
}

fn read_state_variable<'a>(
    r: &mut quick_xml::Reader<&'a [u8]>,
    start: &quick_xml::events::BytesStart<'a>,
) -> anyhow::Result<StateVariableDescriptor> {
    let send_events = start
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == b"sendEvents")
        .map(|attr| attr.unescape_value().map(|v| v == "yes"))
        .transpose()
        .context("unescape sendEvents attribute")?
        .unwrap_or(false);
    let parent_end = start.to_end().into_owned();

    let mut name = None;
    let mut kind = None;

    loop {
        match r.read_event_err_eof()? {
            Event::Start(tag) => {
                let tag_name = tag.name();
                match tag.local_name().as_ref() {
                    b"name" => name = Some(r.read_text(tag_name)?.to_string()),
                    b"dataType" => kind = Some(r.read_text(tag_name)?.parse::<DataType>()?),
                    _ => {
                        r.read_to_end(tag_name)?;
                    }
                }
            }
            Event::End(end) if end == parent_end => break,
            _ => {}
        }
    }

    Ok(StateVariableDescriptor {
        name: name.context("state variable name")?,
        kind: kind.context("state variable data type")?,
        send_events,
    })
}
