//! GENA event subscription, from the control point's side: this crate only ever
//! subscribes to a device's `eventSubURL` and receives the resulting `NOTIFY`
//! callbacks on its own embedded HTTP server — it never publishes events itself.

use std::time::Duration;

use anyhow::Context;
use quick_xml::events::Event;
use reqwest::Method;

use super::xml::XmlReaderExt;

const SUBSCRIBE_METHOD: &str = "SUBSCRIBE";
const UNSUBSCRIBE_METHOD: &str = "UNSUBSCRIBE";
const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(1800);

/// A live GENA subscription against one service's `eventSubURL`.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub sid: String,
    pub timeout: Duration,
}

/// Subscribes to, renews, and cancels GENA event subscriptions against a single
/// service's event subscription URL.
#[derive(Debug)]
pub struct EventSubscriber {
    client: reqwest::Client,
    event_sub_url: String,
    callback_url: String,
}

impl EventSubscriber {
    pub fn new(client: reqwest::Client, event_sub_url: String, callback_url: String) -> Self {
        Self {
            client,
            event_sub_url,
            callback_url,
        }
    }

    /// Sends an initial `SUBSCRIBE` request and returns the subscription id and
    /// timeout the device granted.
    pub async fn subscribe(&self) -> anyhow::Result<Subscription> {
        let method = Method::from_bytes(SUBSCRIBE_METHOD.as_bytes())
            .expect("SUBSCRIBE is a valid http method token");
        let response = self
            .client
            .request(method, &self.event_sub_url)
            .header("CALLBACK", format!("<{}>", self.callback_url))
            .header("NT", "upnp:event")
            .header(
                "TIMEOUT",
                format!("Second-{}", DEFAULT_SUBSCRIBE_TIMEOUT.as_secs()),
            )
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "subscribe request failed with status {}",
            response.status()
        );
        parse_subscribe_response(&response)
    }

    /// Renews an existing subscription before its timeout elapses.
    pub async fn renew(&self, sid: &str) -> anyhow::Result<Subscription> {
        let method = Method::from_bytes(SUBSCRIBE_METHOD.as_bytes())
            .expect("SUBSCRIBE is a valid http method token");
        let response = self
            .client
            .request(method, &self.event_sub_url)
            .header("SID", sid)
            .header(
                "TIMEOUT",
                format!("Second-{}", DEFAULT_SUBSCRIBE_TIMEOUT.as_secs()),
            )
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "renew request failed with status {}",
            response.status()
        );
        parse_subscribe_response(&response)
    }

    /// Cancels a subscription. Best-effort: the caller is usually tearing down
    /// anyway and does not need to retry a failed unsubscribe.
    pub async fn unsubscribe(&self, sid: &str) -> anyhow::Result<()> {
        let method = Method::from_bytes(UNSUBSCRIBE_METHOD.as_bytes())
            .expect("UNSUBSCRIBE is a valid http method token");
        let response = self
            .client
            .request(method, &self.event_sub_url)
            .header("SID", sid)
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "unsubscribe request failed with status {}",
            response.status()
        );
        Ok(())
    }
}

fn parse_subscribe_response(response: &reqwest::Response) -> anyhow::Result<Subscription> {
    let sid = response
        .headers()
        .get("SID")
        .context("missing SID header")?
        .to_str()
        .context("SID header is not valid utf8")?
        .to_owned();
    let timeout_header = response
        .headers()
        .get("TIMEOUT")
        .context("missing TIMEOUT header")?
        .to_str()
        .context("TIMEOUT header is not valid utf8")?;
    let seconds: u64 = timeout_header
        .strip_prefix("Second-")
        .context("TIMEOUT header missing Second- prefix")?
        .parse()
        .context("parse TIMEOUT seconds")?;
    Ok(Subscription {
        sid,
        timeout: Duration::from_secs(seconds),
    })
}

/// One `<e:property>` entry of a GENA event notification body, e.g.
/// `ExternalIPAddress` changing value.
#[derive(Debug, Clone)]
pub struct EventProperty {
    pub name: String,
    pub value: String,
}

/// A parsed GENA `NOTIFY` body (`<e:propertyset>`), delivered by the device to
/// this crate's event callback endpoint whenever a subscribed state variable changes.
#[derive(Debug, Clone, Default)]
pub struct PropertySet {
    pub properties: Vec<EventProperty>,
}

impl PropertySet {
    pub fn parse(body: &str) -> anyhow::Result<Self> {
        let mut reader = quick_xml::Reader::from_str(body);
        let parent = reader.read_to_start()?.into_owned();
        anyhow::ensure!(parent.local_name().as_ref() == b"propertyset");
        let parent_end = parent.to_end().into_owned();

        let mut properties = Vec::new();

        loop {
            match reader.read_event_err_eof()? {
                Event::Start(start) if start.local_name().as_ref() == b"property" => {
                    let property_end = start.to_end().into_owned();
                    let var = reader.read_to_start()?;
                    let name = String::from_utf8(var.local_name().as_ref().to_vec())?;
                    let value = reader.read_text(var.name())?.to_string();
                    reader.read_to_end(property_end.name())?;
                    properties.push(EventProperty { name, value });
                }
                Event::End(end) if end == parent_end => break,
                _ => {}
            }
        }

        Ok(Self { properties })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_property_set() {
        let body = r#"<?xml version="1.0"?>
<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
<e:property>
<ExternalIPAddress>203.0.113.7</ExternalIPAddress>
</e:property>
<e:property>
<SystemUpdateID>42</SystemUpdateID>
</e:property>
</e:propertyset>"#;
        let set = PropertySet::parse(body).unwrap();
        assert_eq!(set.get("ExternalIPAddress"), Some("203.0.113.7"));
        assert_eq!(set.get("SystemUpdateID"), Some("42"));
    }
}
