use crate::debugger::error::Error;

/// A `T`/`S` stop reply, decomposed.
#[derive(Debug, Clone, Default)]
pub struct StopReply {
    pub signal: u8,
    /// The stub's identifier for the reporting thread, verbatim (may carry a
    /// `<pid>.` prefix). Empty for `S` replies.
    pub thread_id: String,
    /// lldb extension: stop reason (e.g. "breakpoint"). Empty if absent.
    pub reason: String,
    /// lldb extension: the full thread list inlined in the stop reply.
    pub threads: Option<Vec<String>>,
    pub thread_pcs: Option<Vec<u64>>,
}

#[derive(Debug, Clone)]
pub enum StopPacket {
    Stopped(StopReply),
    Exited { status: u8, pid: Option<u64> },
}

/// Parse the reply to a resume request (or to `?`/`qThreadStopInfo`, which
/// reuse the stop-reply grammar).
pub(crate) fn parse_stop_packet(payload: &[u8]) -> Result<StopPacket, Error> {
    let text = std::str::from_utf8(payload).map_err(|_| malformed(payload))?;
    match payload.first() {
        Some(b'T') => {
            let signal = parse_signal(text)?;
            let mut reply = StopReply {
                signal,
                ..Default::default()
            };
            for field in text[3..].split(';').filter(|f| !f.is_empty()) {
                let Some((key, value)) = field.split_once(':') else {
                    continue;
                };
                match key {
                    "thread" => reply.thread_id = value.to_string(),
                    "threads" => {
                        reply.threads =
                            Some(value.split(',').map(|s| s.to_string()).collect());
                    }
                    "thread-pcs" => {
                        let pcs = value
                            .split(',')
                            .map(|s| u64::from_str_radix(s, 16))
                            .collect::<Result<Vec<_>, _>>()
                            .map_err(|_| malformed(payload))?;
                        reply.thread_pcs = Some(pcs);
                    }
                    "reason" => reply.reason = value.to_string(),
                    // remaining keys are register values and stub extras
                    _ => {}
                }
            }
            Ok(StopPacket::Stopped(reply))
        }
        Some(b'S') => Ok(StopPacket::Stopped(StopReply {
            signal: parse_signal(text)?,
            ..Default::default()
        })),
        Some(b'W') | Some(b'X') => {
            let rest = &text[1..];
            let (status, extra) = match rest.split_once(';') {
                Some((s, extra)) => (s, Some(extra)),
                None => (rest, None),
            };
            let status = u8::from_str_radix(status, 16).map_err(|_| malformed(payload))?;
            let pid = extra
                .and_then(|e| e.strip_prefix("process:"))
                .and_then(|p| u64::from_str_radix(p.trim_end_matches(';'), 16).ok());
            Ok(StopPacket::Exited { status, pid })
        }
        _ => Err(malformed(payload)),
    }
}

fn parse_signal(text: &str) -> Result<u8, Error> {
    text.get(1..3)
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| malformed(text.as_bytes()))
}

/// Thread identifiers are hex digits, optionally prefixed by `<pid>.`; the
/// portion after the period is the tid.
pub(crate) fn parse_thread_id(id: &str) -> Result<u32, Error> {
    let tid = match id.split_once('.') {
        Some((_, tid)) => tid,
        None => id,
    };
    u32::from_str_radix(tid, 16).map_err(|_| Error::MalformedThreadID(id.to_string()))
}

fn malformed(payload: &[u8]) -> Error {
    Error::MalformedReply(String::from_utf8_lossy(payload).into_owned())
}
