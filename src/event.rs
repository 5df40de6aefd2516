//! Event routing: decide which channel(s), if any, an incoming event targets.
use crate::message::Headers;

/// The ordered routing rule table (§4.4): first match wins.
pub fn routing_set(event_name: &str, headers: &Headers) -> Vec<String> {
    let lower = event_name.to_ascii_lowercase();

    if lower == "rename" {
        if let Some(old) = headers.get("oldname") {
            return vec![old.clone()];
        }
    }
    if lower != "newchannel" && lower != "channelreload" {
        if let Some(channel) = headers.get("channel") {
            return vec![channel.clone()];
        }
    }
    if lower == "link" || lower == "unlink" {
        if let (Some(c1), Some(c2)) = (headers.get("channel1"), headers.get("channel2")) {
            return vec![c1.clone(), c2.clone()];
        }
    }
    if lower == "dial" {
        if let Some(source) = headers.get("source") {
            return vec![source.clone()];
        }
    }
    Vec::new()
}
