#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)]

extern crate alloc;

use core::fmt::{self, Display};
use core::net::Ipv4Addr;
use core::str::Utf8Error;

use num_enum::TryFromPrimitive;

use self::options::Options;

pub mod lease;
pub mod options;
pub mod pool;
pub mod reserve;
pub mod server;
pub mod store;

#[cfg(feature = "io")]
pub mod io;

/// UDP port the server listens on.
pub const DEFAULT_SERVER_PORT: u16 = 67;
/// UDP port replies to clients are addressed to.
pub const DEFAULT_CLIENT_PORT: u16 = 68;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    DataUnderflow,
    BufferOverflow,
    MalformedHeader,
    MalformedOption,
    InvalidUtf8Str(Utf8Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataUnderflow => write!(f, "Data underflow"),
            Self::BufferOverflow => write!(f, "Buffer overflow"),
            Self::MalformedHeader => write!(f, "Malformed header"),
            Self::MalformedOption => write!(f, "Malformed option"),
            Self::InvalidUtf8Str(err) => write!(f, "Invalid UTF-8 string: {err}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

///
/// DHCP Message Type.
///
/// # Standards
///
/// The semantics of the various DHCP message types are described in RFC 2131 (see Table 2).
/// Their numeric values are described in Section 9.6 of RFC 2132.
///
#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate available servers.
    Discover = 1,

    /// Server to client in response to DHCPDISCOVER with offer of configuration parameters.
    Offer = 2,

    /// Client message to servers either (a) requesting offered parameters from one server and
    /// implicitly declining offers from all others, (b) confirming correctness of previously
    /// allocated address after, e.g., system reboot, or (c) extending the lease on a particular
    /// network address.
    Request = 3,

    /// Client to server indicating network address is already in use.
    Decline = 4,

    /// Server to client with configuration parameters, including committed network address.
    Ack = 5,

    /// Server to client indicating client's notion of network address is incorrect (e.g., client
    /// has moved to new subnet) or client's lease as expired.
    Nak = 6,

    /// Client to server relinquishing network address and cancelling remaining lease.
    Release = 7,

    /// Client to server, asking only for local configuration parameters; client already has
    /// externally configured network address.
    Inform = 8,
}

impl Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };

        write!(f, "{name}")
    }
}

/// DHCP Packet Structure
///
/// A decoded BOOTP datagram: the fixed header, the legacy `sname`/`file` fields
/// and the options that followed the magic cookie. Options that overflowed into
/// `sname`/`file` via the Option Overload mechanism are already reassembled
/// into `options`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Packet {
    pub reply: bool,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub broadcast: bool,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Options,
}

impl Packet {
    const COOKIE: [u8; 4] = [99, 130, 83, 99];

    const BOOT_REQUEST: u8 = 1; // From Client
    const BOOT_REPLY: u8 = 2; // From Server

    const ETHERNET: u8 = 1;

    // The BROADCAST bit of the big-endian `flags` field
    const FLAG_BROADCAST: u16 = 0x8000;

    pub fn new_request(mac: &[u8], xid: u32, secs: u16, options: Options) -> Self {
        let hlen = mac.len().min(16);

        let mut chaddr = [0; 16];
        chaddr[..hlen].copy_from_slice(&mac[..hlen]);

        Self {
            reply: false,
            htype: Self::ETHERNET,
            hlen: hlen as u8,
            hops: 0,
            xid,
            secs,
            broadcast: false,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0; 64],
            file: [0; 128],
            options,
        }
    }

    /// Constructs a reply to this request, mirroring the transaction id, the
    /// broadcast flag, the relay agent address and the client hardware address.
    pub fn new_reply(&self, yiaddr: Ipv4Addr, options: Options) -> Packet {
        Packet {
            reply: true,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            broadcast: self.broadcast,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname: [0; 64],
            file: [0; 128],
            options,
        }
    }

    /// The effective hardware address, i.e. the first `hlen` bytes of `chaddr`.
    pub fn hardware_address(&self) -> &[u8] {
        &self.chaddr[..(self.hlen as usize).min(16)]
    }

    /// The value of the message type option, if any.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.message_type()
    }

    /// The server host name, unless the field was used as extra options space.
    pub fn server_name(&self) -> Result<&str, Error> {
        zero_terminated(&self.sname)
    }

    /// The boot file name, unless the field was used as extra options space.
    pub fn boot_file(&self) -> Result<&str, Error> {
        zero_terminated(&self.file)
    }

    /// Parses the packet from a byte slice
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(data);

        let reply = match bytes.byte()? {
            Self::BOOT_REQUEST => false,
            Self::BOOT_REPLY => true,
            _ => Err(Error::MalformedHeader)?,
        };

        let htype = bytes.byte()?;

        let hlen = bytes.byte()?;
        if hlen > 16 {
            Err(Error::MalformedHeader)?;
        }

        let hops = bytes.byte()?;
        let xid = u32::from_be_bytes(bytes.arr()?);
        let secs = u16::from_be_bytes(bytes.arr()?);
        let broadcast = u16::from_be_bytes(bytes.arr()?) & Self::FLAG_BROADCAST != 0;

        let ciaddr = bytes.arr::<4>()?.into();
        let yiaddr = bytes.arr::<4>()?.into();
        let siaddr = bytes.arr::<4>()?.into();
        let giaddr = bytes.arr::<4>()?.into();

        let chaddr = bytes.arr::<16>()?;
        let sname = bytes.arr::<64>()?;
        let file = bytes.arr::<128>()?;

        if bytes.arr::<4>()? != Self::COOKIE {
            Err(Error::MalformedHeader)?;
        }

        let options = Options::decode(bytes.remaining(), &sname, &file)?;

        Ok(Self {
            reply,
            htype,
            hlen,
            hops,
            xid,
            secs,
            broadcast,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Encodes the packet into the provided buf slice, padding the output with
    /// zeroes past the End option until it is at least `min_size` bytes long.
    pub fn encode<'o>(&self, buf: &'o mut [u8], min_size: usize) -> Result<&'o [u8], Error> {
        let mut bytes = BytesOut::new(buf);

        bytes
            .byte(if self.reply {
                Self::BOOT_REPLY
            } else {
                Self::BOOT_REQUEST
            })?
            .byte(self.htype)?
            .byte(self.hlen)?
            .byte(self.hops)?
            .push(&u32::to_be_bytes(self.xid))?
            .push(&u16::to_be_bytes(self.secs))?
            .push(&u16::to_be_bytes(if self.broadcast {
                Self::FLAG_BROADCAST
            } else {
                0
            }))?
            .push(&self.ciaddr.octets())?
            .push(&self.yiaddr.octets())?
            .push(&self.siaddr.octets())?
            .push(&self.giaddr.octets())?;

        // chaddr is zero-padded past the effective hardware address length
        let hlen = (self.hlen as usize).min(16);
        bytes.push(&self.chaddr[..hlen])?;
        for _ in hlen..16 {
            bytes.byte(0)?;
        }

        bytes.push(&self.sname)?;
        bytes.push(&self.file)?;

        bytes.push(&Self::COOKIE)?;

        self.options.encode(&mut bytes)?;

        bytes.byte(options::END)?;

        while bytes.len() < min_size {
            bytes.byte(options::PAD)?;
        }

        let len = bytes.len();

        Ok(&buf[..len])
    }
}

fn zero_terminated(bytes: &[u8]) -> Result<&str, Error> {
    let end = bytes.iter().position(|byte| *byte == 0).unwrap_or(bytes.len());

    core::str::from_utf8(&bytes[..end]).map_err(Error::InvalidUtf8Str)
}

pub(crate) struct BytesIn<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BytesIn<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.offset == self.data.len()
    }

    pub fn byte(&mut self) -> Result<u8, Error> {
        self.arr::<1>().map(|arr| arr[0])
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.data.len() - self.offset {
            Err(Error::DataUnderflow)
        } else {
            let data = &self.data[self.offset..self.offset + len];
            self.offset += len;

            Ok(data)
        }
    }

    pub fn arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let slice = self.slice(N)?;

        let mut data = [0; N];
        data.copy_from_slice(slice);

        Ok(data)
    }

    pub fn remaining(&mut self) -> &'a [u8] {
        let len = self.data.len() - self.offset;
        let data = &self.data[self.offset..];

        self.offset += len;

        data
    }
}

pub(crate) struct BytesOut<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> BytesOut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn byte(&mut self, data: u8) -> Result<&mut Self, Error> {
        self.push(&[data])
    }

    pub fn push(&mut self, data: &[u8]) -> Result<&mut Self, Error> {
        if data.len() > self.buf.len() - self.offset {
            Err(Error::BufferOverflow)
        } else {
            self.buf[self.offset..self.offset + data.len()].copy_from_slice(data);
            self.offset += data.len();

            Ok(self)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::options::DhcpOption;

    fn request() -> Packet {
        let mut options = Options::new();
        options.set_message_type(MessageType::Discover);
        options.push(DhcpOption::HostName("laptop".into()));
        options.push(DhcpOption::ParameterRequestList(alloc::vec![1, 3, 6]));

        let mut packet = Packet::new_request(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01], 0xdeadbeef, 4, options);
        packet.broadcast = true;

        packet
    }

    #[test]
    fn roundtrip() {
        let packet = request();

        let mut buf = [0; 1500];
        let data = packet.encode(&mut buf, 0).unwrap();

        assert_eq!(Packet::decode(data).unwrap(), packet);
    }

    #[test]
    fn padding_to_minimum_size() {
        let packet = request();

        let mut buf = [0; 1500];
        let data = packet.encode(&mut buf, 312).unwrap();

        assert_eq!(data.len(), 312);
        assert_eq!(Packet::decode(data).unwrap(), packet);
    }

    #[test]
    fn bad_cookie_is_rejected() {
        let packet = request();

        let mut buf = [0; 1500];
        let len = packet.encode(&mut buf, 0).unwrap().len();

        // The cookie sits right past the fixed header
        buf[238] = 0;

        assert!(matches!(
            Packet::decode(&buf[..len]),
            Err(Error::MalformedHeader)
        ));
    }

    #[test]
    fn oversized_hlen_is_rejected() {
        let packet = request();

        let mut buf = [0; 1500];
        let len = packet.encode(&mut buf, 0).unwrap().len();

        buf[2] = 17;

        assert!(matches!(
            Packet::decode(&buf[..len]),
            Err(Error::MalformedHeader)
        ));
    }

    #[test]
    fn reply_mirrors_the_request() {
        let packet = request();

        let reply = packet.new_reply("10.0.0.100".parse().unwrap(), Options::new());

        assert!(reply.reply);
        assert_eq!(reply.xid, packet.xid);
        assert_eq!(reply.secs, 0);
        assert!(reply.broadcast);
        assert_eq!(reply.chaddr, packet.chaddr);
        assert_eq!(reply.hlen, packet.hlen);
        assert_eq!(reply.yiaddr, "10.0.0.100".parse::<Ipv4Addr>().unwrap());
    }
}
