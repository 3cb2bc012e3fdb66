use bytes::Bytes;

/// Bytes of `kind` plus `size` preceding every frame body.
pub const FRAME_HEADER_LEN: usize = 8;

/// Everything the coordinator ever puts on or takes off the wire.
/// Discriminants are the wire values; they are stable protocol surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Ok = 1,
    Init = 100,
    SyncConfig = 200,
    SyncShader = 201,
    SyncTexture = 202,
    SyncMaterial = 203,
    SyncMesh = 204,
    SyncCamera = 205,
    SyncEmissive = 206,
    BuildBvh = 250,
    SyncWbvh = 260,
    SyncImage = 290,
    RenderStart = 300,
    RenderStop = 301,
    RenderStats = 302,
    RenderPause = 303,
    RenderResume = 304,
}

impl MessageKind {
    pub fn from_wire(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => MessageKind::Ok,
            100 => MessageKind::Init,
            200 => MessageKind::SyncConfig,
            201 => MessageKind::SyncShader,
            202 => MessageKind::SyncTexture,
            203 => MessageKind::SyncMaterial,
            204 => MessageKind::SyncMesh,
            205 => MessageKind::SyncCamera,
            206 => MessageKind::SyncEmissive,
            250 => MessageKind::BuildBvh,
            260 => MessageKind::SyncWbvh,
            290 => MessageKind::SyncImage,
            300 => MessageKind::RenderStart,
            301 => MessageKind::RenderStop,
            302 => MessageKind::RenderStats,
            303 => MessageKind::RenderPause,
            304 => MessageKind::RenderResume,
            _ => return None,
        })
    }
}

/// A single framed message. On the wire: `kind: u32 LE`, `size: u32 LE`,
/// then exactly `size` body bytes. An empty body is legal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub body: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            body: Bytes::new(),
        }
    }

    pub fn with_body(kind: MessageKind, body: Bytes) -> Self {
        Self { kind, body }
    }

    pub fn header_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        header[4..].copy_from_slice(&(self.body.len() as u32).to_le_bytes());
        header
    }

    /// Header plus body as one contiguous buffer. Send paths go through
    /// [`WriteBuffer`](crate::protocol::WriteBuffer) instead; this exists
    /// for peers and tests that write frames directly.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.header_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}
