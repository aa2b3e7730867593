use heapless::Vec;
use thiserror::Error;

use crate::config::device::{AESKey, AppNonce, DevAddr, DevNonce, NetID, EUI64};
use crate::crypto::{self, CipherError, Direction, MAX_FRM_PAYLOAD_SIZE, MIC_SIZE};

/// Maximum PHY payload size
pub const MAX_PHY_PAYLOAD_SIZE: usize = 255;

/// Maximum FOpts length
pub const MAX_FOPTS_SIZE: usize = 15;

/// Encoded PHY payload
pub type PhyBytes = Vec<u8, MAX_PHY_PAYLOAD_SIZE>;

const JOIN_REQUEST_SIZE: usize = 18;
const JOIN_ACCEPT_SIZE: usize = 12;
const CF_LIST_SIZE: usize = 16;
const FHDR_MIN_SIZE: usize = 7;

/// Frame encoding and decoding errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Frame is shorter than its message type allows
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// Encoded frame exceeds the PHY payload limit
    #[error("frame exceeds {MAX_PHY_PAYLOAD_SIZE} bytes")]
    TooLong,

    /// Major version other than LoRaWAN R1
    #[error("unsupported major version {0}")]
    UnsupportedMajor(u8),

    /// Message type this codec does not carry
    #[error("unsupported message type {0:?}")]
    UnsupportedMType(MType),

    /// Payload size does not match its message type
    #[error("invalid {kind} length {len}")]
    InvalidLength {
        /// Payload kind
        kind: &'static str,
        /// Offending length
        len: usize,
    },

    /// FOpts longer than allowed
    #[error("FOpts of {0} bytes exceeds {MAX_FOPTS_SIZE}")]
    FOptsTooLong(usize),

    /// Operation needs a decrypted join accept
    #[error("join accept payload is still encrypted")]
    Encrypted,

    /// Operation needs a join accept
    #[error("frame does not carry a join accept")]
    NotJoinAccept,

    /// Operation needs a data frame
    #[error("frame does not carry a data payload")]
    NotData,

    /// Payload cipher failure
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// MAC header types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MType {
    /// Join request
    JoinRequest = 0x00,
    /// Join accept
    JoinAccept = 0x20,
    /// Unconfirmed data uplink
    UnconfirmedDataUp = 0x40,
    /// Unconfirmed data downlink
    UnconfirmedDataDown = 0x60,
    /// Confirmed data uplink
    ConfirmedDataUp = 0x80,
    /// Confirmed data downlink
    ConfirmedDataDown = 0xA0,
    /// Rejoin request
    RejoinRequest = 0xC0,
    /// Proprietary
    Proprietary = 0xE0,
}

impl MType {
    fn from_byte(byte: u8) -> Self {
        match byte & 0xE0 {
            0x00 => MType::JoinRequest,
            0x20 => MType::JoinAccept,
            0x40 => MType::UnconfirmedDataUp,
            0x60 => MType::UnconfirmedDataDown,
            0x80 => MType::ConfirmedDataUp,
            0xA0 => MType::ConfirmedDataDown,
            0xC0 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    /// Direction of a data frame of this type
    pub fn direction(&self) -> Direction {
        match self {
            MType::JoinAccept | MType::UnconfirmedDataDown | MType::ConfirmedDataDown => {
                Direction::Down
            }
            _ => Direction::Up,
        }
    }

    fn is_data(&self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }
}

/// LoRaWAN major version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    /// LoRaWAN R1
    LoRaWANR1 = 0,
}

/// MAC header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MHDR {
    /// Message type
    pub mtype: MType,
    /// Major version
    pub major: Major,
}

impl MHDR {
    /// Header for the given message type, LoRaWAN R1
    pub fn new(mtype: MType) -> Self {
        Self {
            mtype,
            major: Major::LoRaWANR1,
        }
    }

    fn to_byte(self) -> u8 {
        self.mtype as u8 | self.major as u8
    }

    fn from_byte(byte: u8) -> Result<Self, FrameError> {
        match byte & 0x03 {
            0 => Ok(Self::new(MType::from_byte(byte))),
            major => Err(FrameError::UnsupportedMajor(major)),
        }
    }
}

/// Frame header flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    /// Adaptive data rate
    pub adr: bool,
    /// ADR acknowledgement request
    pub adr_ack_req: bool,
    /// Acknowledgement
    pub ack: bool,
    /// Frame pending
    pub f_pending: bool,
}

impl FCtrl {
    fn to_byte(self, f_opts_len: u8) -> u8 {
        let mut byte = f_opts_len & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }

    fn from_byte(byte: u8) -> (Self, usize) {
        let fctrl = Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
        };
        (fctrl, usize::from(byte & 0x0F))
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FHDR {
    /// Device address
    pub dev_addr: DevAddr,
    /// Frame control
    pub f_ctrl: FCtrl,
    /// Full frame counter; only the low 16 bits go on the air
    pub f_cnt: u32,
    /// Piggybacked MAC commands
    pub f_opts: Vec<u8, MAX_FOPTS_SIZE>,
}

impl FHDR {
    /// Header without options
    pub fn new(dev_addr: DevAddr, f_cnt: u32) -> Self {
        Self {
            dev_addr,
            f_ctrl: FCtrl::default(),
            f_cnt,
            f_opts: Vec::new(),
        }
    }

    fn serialize(&self, buffer: &mut PhyBytes) -> Result<(), FrameError> {
        put(buffer, &self.dev_addr.to_wire())?;
        put(buffer, &[self.f_ctrl.to_byte(self.f_opts.len() as u8)])?;
        put(buffer, &(self.f_cnt as u16).to_le_bytes())?;
        put(buffer, &self.f_opts)
    }

    fn parse(bytes: &[u8]) -> Result<(Self, usize), FrameError> {
        if bytes.len() < FHDR_MIN_SIZE {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let dev_addr = DevAddr::from_wire(&bytes[..4]).ok_or(FrameError::TooShort(bytes.len()))?;
        let (f_ctrl, f_opts_len) = FCtrl::from_byte(bytes[4]);
        let f_cnt = u16::from_le_bytes([bytes[5], bytes[6]]);
        let end = FHDR_MIN_SIZE + f_opts_len;
        if bytes.len() < end {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let f_opts = Vec::from_slice(&bytes[FHDR_MIN_SIZE..end])
            .map_err(|_| FrameError::FOptsTooLong(f_opts_len))?;

        Ok((
            Self {
                dev_addr,
                f_ctrl,
                f_cnt: u32::from(f_cnt),
                f_opts,
            },
            end,
        ))
    }
}

/// Join request payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequestPayload {
    /// Application EUI
    pub app_eui: EUI64,
    /// Device EUI
    pub dev_eui: EUI64,
    /// Device nonce
    pub dev_nonce: DevNonce,
}

impl JoinRequestPayload {
    fn serialize(&self, buffer: &mut PhyBytes) -> Result<(), FrameError> {
        put(buffer, &self.app_eui.to_wire())?;
        put(buffer, &self.dev_eui.to_wire())?;
        put(buffer, &self.dev_nonce.to_wire())
    }

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let invalid = || FrameError::InvalidLength {
            kind: "join request",
            len: bytes.len(),
        };
        if bytes.len() != JOIN_REQUEST_SIZE {
            return Err(invalid());
        }
        Ok(Self {
            app_eui: EUI64::from_wire(&bytes[0..8]).ok_or_else(invalid)?,
            dev_eui: EUI64::from_wire(&bytes[8..16]).ok_or_else(invalid)?,
            dev_nonce: DevNonce::from_wire(&bytes[16..18]).ok_or_else(invalid)?,
        })
    }
}

/// Decrypted join accept payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAcceptPayload {
    /// Network nonce
    pub app_nonce: AppNonce,
    /// Network identifier
    pub net_id: NetID,
    /// Assigned device address
    pub dev_addr: DevAddr,
    /// RX1 data rate offset and RX2 data rate
    pub dl_settings: u8,
    /// RX1 delay in seconds
    pub rx_delay: u8,
    /// Optional channel frequency list
    pub cf_list: Option<[u8; CF_LIST_SIZE]>,
}

impl JoinAcceptPayload {
    /// RX1 data rate offset
    pub fn rx1_dr_offset(&self) -> u8 {
        (self.dl_settings >> 4) & 0x07
    }

    /// RX2 data rate index
    pub fn rx2_data_rate(&self) -> u8 {
        self.dl_settings & 0x0F
    }

    fn serialize(&self, buffer: &mut PhyBytes) -> Result<(), FrameError> {
        put(buffer, &self.app_nonce.to_wire())?;
        put(buffer, &self.net_id.to_wire())?;
        put(buffer, &self.dev_addr.to_wire())?;
        put(buffer, &[self.dl_settings, self.rx_delay])?;
        if let Some(cf_list) = &self.cf_list {
            put(buffer, cf_list)?;
        }
        Ok(())
    }

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let invalid = || FrameError::InvalidLength {
            kind: "join accept",
            len: bytes.len(),
        };
        let cf_list = match bytes.len() {
            JOIN_ACCEPT_SIZE => None,
            n if n == JOIN_ACCEPT_SIZE + CF_LIST_SIZE => {
                let mut cf_list = [0u8; CF_LIST_SIZE];
                cf_list.copy_from_slice(&bytes[JOIN_ACCEPT_SIZE..]);
                Some(cf_list)
            }
            _ => return Err(invalid()),
        };
        Ok(Self {
            app_nonce: AppNonce::from_wire(&bytes[0..3]).ok_or_else(invalid)?,
            net_id: NetID::from_wire(&bytes[3..6]).ok_or_else(invalid)?,
            dev_addr: DevAddr::from_wire(&bytes[6..10]).ok_or_else(invalid)?,
            dl_settings: bytes[10],
            rx_delay: bytes[11],
            cf_list,
        })
    }
}

/// Data frame MAC payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacPayload {
    /// Frame header
    pub fhdr: FHDR,
    /// Port, absent when there is no FRMPayload
    pub f_port: Option<u8>,
    /// Frame payload (encrypted on the air)
    pub frm_payload: Vec<u8, MAX_FRM_PAYLOAD_SIZE>,
}

impl MacPayload {
    fn serialize(&self, buffer: &mut PhyBytes) -> Result<(), FrameError> {
        self.fhdr.serialize(buffer)?;
        if let Some(f_port) = self.f_port {
            put(buffer, &[f_port])?;
            put(buffer, &self.frm_payload)?;
        }
        Ok(())
    }

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let (fhdr, used) = FHDR::parse(bytes)?;
        let rest = &bytes[used..];
        let (f_port, frm_payload) = match rest.split_first() {
            Some((&f_port, frm)) => (
                Some(f_port),
                Vec::from_slice(frm).map_err(|_| FrameError::TooLong)?,
            ),
            None => (None, Vec::new()),
        };
        Ok(Self {
            fhdr,
            f_port,
            frm_payload,
        })
    }
}

/// MAC payload variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Join request
    JoinRequest(JoinRequestPayload),
    /// Decrypted join accept
    JoinAccept(JoinAcceptPayload),
    /// Join accept as received from the air
    EncryptedJoinAccept(Vec<u8, 28>),
    /// Data uplink or downlink
    Data(MacPayload),
}

/// LoRaWAN PHY payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhyPayload {
    /// MAC header
    pub mhdr: MHDR,
    /// MAC payload
    pub payload: Payload,
    /// Message integrity code
    pub mic: [u8; MIC_SIZE],
}

impl PhyPayload {
    /// Join request frame; call [`PhyPayload::set_mic`] before sending
    pub fn join_request(app_eui: EUI64, dev_eui: EUI64, dev_nonce: DevNonce) -> Self {
        Self {
            mhdr: MHDR::new(MType::JoinRequest),
            payload: Payload::JoinRequest(JoinRequestPayload {
                app_eui,
                dev_eui,
                dev_nonce,
            }),
            mic: [0; MIC_SIZE],
        }
    }

    /// Join accept frame in plaintext form
    pub fn join_accept(payload: JoinAcceptPayload) -> Self {
        Self {
            mhdr: MHDR::new(MType::JoinAccept),
            payload: Payload::JoinAccept(payload),
            mic: [0; MIC_SIZE],
        }
    }

    /// Data frame carrying a plaintext FRMPayload
    pub fn data(
        mtype: MType,
        fhdr: FHDR,
        f_port: u8,
        frm_payload: &[u8],
    ) -> Result<Self, FrameError> {
        if !mtype.is_data() {
            return Err(FrameError::UnsupportedMType(mtype));
        }
        let frm_payload = Vec::from_slice(frm_payload)
            .map_err(|_| CipherError::PayloadTooLarge(frm_payload.len()))?;
        Ok(Self {
            mhdr: MHDR::new(mtype),
            payload: Payload::Data(MacPayload {
                fhdr,
                f_port: Some(f_port),
                frm_payload,
            }),
            mic: [0; MIC_SIZE],
        })
    }

    /// MHDR and MAC payload, the part covered by the MIC
    fn mic_bytes(&self) -> Result<PhyBytes, FrameError> {
        let mut buffer = Vec::new();
        put(&mut buffer, &[self.mhdr.to_byte()])?;
        match &self.payload {
            Payload::JoinRequest(p) => p.serialize(&mut buffer)?,
            Payload::JoinAccept(p) => p.serialize(&mut buffer)?,
            Payload::EncryptedJoinAccept(bytes) => put(&mut buffer, bytes)?,
            Payload::Data(p) => p.serialize(&mut buffer)?,
        }
        Ok(buffer)
    }

    /// Encode to bytes
    pub fn to_bytes(&self) -> Result<PhyBytes, FrameError> {
        let mut buffer = self.mic_bytes()?;
        put(&mut buffer, &self.mic)?;
        Ok(buffer)
    }

    /// Decode from bytes.
    ///
    /// Join accepts stay encrypted until [`PhyPayload::decrypt_join_accept`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 1 + MIC_SIZE {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if bytes.len() > MAX_PHY_PAYLOAD_SIZE {
            return Err(FrameError::TooLong);
        }

        let mhdr = MHDR::from_byte(bytes[0])?;
        let body = &bytes[1..bytes.len() - MIC_SIZE];
        let mut mic = [0u8; MIC_SIZE];
        mic.copy_from_slice(&bytes[bytes.len() - MIC_SIZE..]);

        let payload = match mhdr.mtype {
            MType::JoinRequest => Payload::JoinRequest(JoinRequestPayload::parse(body)?),
            MType::JoinAccept => {
                if body.len() != JOIN_ACCEPT_SIZE && body.len() != JOIN_ACCEPT_SIZE + CF_LIST_SIZE {
                    return Err(FrameError::InvalidLength {
                        kind: "join accept",
                        len: body.len(),
                    });
                }
                let encrypted = Vec::from_slice(body).map_err(|_| FrameError::TooLong)?;
                Payload::EncryptedJoinAccept(encrypted)
            }
            m if m.is_data() => Payload::Data(MacPayload::parse(body)?),
            m => return Err(FrameError::UnsupportedMType(m)),
        };

        Ok(Self { mhdr, payload, mic })
    }

    fn compute_mic(&self, key: &AESKey) -> Result<[u8; MIC_SIZE], FrameError> {
        let bytes = self.mic_bytes()?;
        match &self.payload {
            Payload::JoinRequest(_) | Payload::JoinAccept(_) => {
                Ok(crypto::compute_join_mic(key, &bytes))
            }
            Payload::EncryptedJoinAccept(_) => Err(FrameError::Encrypted),
            Payload::Data(p) => Ok(crypto::compute_mic(
                key,
                &bytes,
                p.fhdr.dev_addr,
                p.fhdr.f_cnt,
                self.mhdr.mtype.direction(),
            )),
        }
    }

    /// Compute and store the MIC
    pub fn set_mic(&mut self, key: &AESKey) -> Result<(), FrameError> {
        self.mic = self.compute_mic(key)?;
        Ok(())
    }

    /// Check the stored MIC against `key`
    pub fn validate_mic(&self, key: &AESKey) -> Result<bool, FrameError> {
        Ok(self.compute_mic(key)? == self.mic)
    }

    /// Decrypt a received join accept in place with the root key
    pub fn decrypt_join_accept(&mut self, key: &AESKey) -> Result<(), FrameError> {
        let encrypted = match &self.payload {
            Payload::EncryptedJoinAccept(bytes) => bytes,
            Payload::JoinAccept(_) => return Ok(()),
            _ => return Err(FrameError::NotJoinAccept),
        };

        let mut ciphertext: Vec<u8, 32> = Vec::new();
        put(&mut ciphertext, encrypted)?;
        put(&mut ciphertext, &self.mic)?;

        let plaintext = crypto::decrypt_join_accept(key, &ciphertext)?;
        let split = plaintext.len() - MIC_SIZE;
        let payload = JoinAcceptPayload::parse(&plaintext[..split])?;

        self.mic.copy_from_slice(&plaintext[split..]);
        self.payload = Payload::JoinAccept(payload);
        Ok(())
    }

    /// Encrypt a plaintext join accept in place, as a network server would
    pub fn encrypt_join_accept(&mut self, key: &AESKey) -> Result<(), FrameError> {
        let payload = match &self.payload {
            Payload::JoinAccept(p) => p,
            Payload::EncryptedJoinAccept(_) => return Ok(()),
            _ => return Err(FrameError::NotJoinAccept),
        };

        let mut plaintext = Vec::new();
        payload.serialize(&mut plaintext)?;
        put(&mut plaintext, &self.mic)?;

        let ciphertext = crypto::encrypt_join_accept(key, &plaintext)?;
        let split = ciphertext.len() - MIC_SIZE;
        self.mic.copy_from_slice(&ciphertext[split..]);
        self.payload = Payload::EncryptedJoinAccept(
            Vec::from_slice(&ciphertext[..split]).map_err(|_| FrameError::TooLong)?,
        );
        Ok(())
    }

    /// Encrypt or decrypt the FRMPayload in place.
    ///
    /// The counter-mode cipher is symmetric, so one call toggles between
    /// plaintext and ciphertext.
    pub fn apply_frm_cipher(&mut self, key: &AESKey) -> Result<(), FrameError> {
        let direction = self.mhdr.mtype.direction();
        let Payload::Data(p) = &mut self.payload else {
            return Err(FrameError::NotData);
        };
        p.frm_payload = crypto::encrypt_payload(
            key,
            p.fhdr.dev_addr,
            p.fhdr.f_cnt,
            direction,
            &p.frm_payload,
        )?;
        Ok(())
    }

    /// Data payload, if this is a data frame
    pub fn mac_payload(&self) -> Option<&MacPayload> {
        match &self.payload {
            Payload::Data(p) => Some(p),
            _ => None,
        }
    }

    /// Mutable data payload, if this is a data frame
    pub fn mac_payload_mut(&mut self) -> Option<&mut MacPayload> {
        match &mut self.payload {
            Payload::Data(p) => Some(p),
            _ => None,
        }
    }
}

fn put<const N: usize>(buffer: &mut Vec<u8, N>, bytes: &[u8]) -> Result<(), FrameError> {
    buffer.extend_from_slice(bytes).map_err(|_| FrameError::TooLong)
}
