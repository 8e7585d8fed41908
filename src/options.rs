//! The DHCP option registry and the options-area codec.
//!
//! Decoding reassembles the options area per RFC 2132: Pad/End framing, the
//! Option Overload mechanism (option 52) pulling extra option space out of the
//! legacy `sname`/`file` header fields, and concatenation of TLV fragments
//! that carry the same code. Encoding splits values longer than 255 bytes back
//! into same-code fragments.

use alloc::string::String;
use alloc::vec::Vec;

use core::net::Ipv4Addr;

use num_enum::TryFromPrimitive;

use crate::{BytesIn, BytesOut, Error, MessageType};

// RFC 1497 vendor extensions
pub const SUBNET_MASK: u8 = 1;
pub const ROUTER: u8 = 3;
pub const DOMAIN_NAME_SERVER: u8 = 6;
pub const HOST_NAME: u8 = 12;
pub const NTP_SERVERS: u8 = 42;

// DHCP extensions
pub const REQUESTED_IP_ADDRESS: u8 = 50;
pub const IP_ADDRESS_LEASE_TIME: u8 = 51;
pub const OPTION_OVERLOAD: u8 = 52;
pub const DHCP_MESSAGE_TYPE: u8 = 53;
pub const SERVER_IDENTIFIER: u8 = 54;
pub const PARAMETER_REQUEST_LIST: u8 = 55;
pub const MESSAGE: u8 = 56;
pub const MAX_MESSAGE_SIZE: u8 = 57;
pub const RENEWAL_TIME: u8 = 58;
pub const REBINDING_TIME: u8 = 59;
pub const VENDOR_CLASS_IDENTIFIER: u8 = 60;
pub const CLIENT_IDENTIFIER: u8 = 61;
pub const TFTP_SERVER_NAME: u8 = 66;
pub const BOOT_FILE_NAME: u8 = 67;
pub const USER_CLASS: u8 = 77;
pub const CLIENT_FQDN: u8 = 81;
pub const RELAY_AGENT_INFORMATION: u8 = 82;

pub(crate) const PAD: u8 = 0;
pub(crate) const END: u8 = 255;

/// Which of the legacy header fields carry options (the value of option 52).
const OVERLOAD_FILE: u8 = 1;
const OVERLOAD_SNAME: u8 = 2;

/// A single, typed DHCP option.
///
/// Codes without a dedicated variant decode as `Generic`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DomainNameServer(Vec<Ipv4Addr>),
    HostName(String),
    NtpServers(Vec<Ipv4Addr>),
    RequestedIpAddress(Ipv4Addr),
    IpAddressLeaseTime(u32),
    OptionOverload(u8),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    Message(String),
    MaxMessageSize(u16),
    RenewalTime(u32),
    RebindingTime(u32),
    VendorClassIdentifier(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    TftpServerName(String),
    BootFileName(String),
    UserClass(Vec<u8>),
    ClientFqdn(Vec<u8>),
    Generic(u8, Vec<u8>),
}

impl DhcpOption {
    pub const fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => SUBNET_MASK,
            Self::Router(_) => ROUTER,
            Self::DomainNameServer(_) => DOMAIN_NAME_SERVER,
            Self::HostName(_) => HOST_NAME,
            Self::NtpServers(_) => NTP_SERVERS,
            Self::RequestedIpAddress(_) => REQUESTED_IP_ADDRESS,
            Self::IpAddressLeaseTime(_) => IP_ADDRESS_LEASE_TIME,
            Self::OptionOverload(_) => OPTION_OVERLOAD,
            Self::MessageType(_) => DHCP_MESSAGE_TYPE,
            Self::ServerIdentifier(_) => SERVER_IDENTIFIER,
            Self::ParameterRequestList(_) => PARAMETER_REQUEST_LIST,
            Self::Message(_) => MESSAGE,
            Self::MaxMessageSize(_) => MAX_MESSAGE_SIZE,
            Self::RenewalTime(_) => RENEWAL_TIME,
            Self::RebindingTime(_) => REBINDING_TIME,
            Self::VendorClassIdentifier(_) => VENDOR_CLASS_IDENTIFIER,
            Self::ClientIdentifier(_) => CLIENT_IDENTIFIER,
            Self::TftpServerName(_) => TFTP_SERVER_NAME,
            Self::BootFileName(_) => BOOT_FILE_NAME,
            Self::UserClass(_) => USER_CLASS,
            Self::ClientFqdn(_) => CLIENT_FQDN,
            Self::Generic(code, _) => *code,
        }
    }

    /// Decodes the (already reassembled) value bytes of the option with the given code.
    fn decode_value(code: u8, value: &[u8]) -> Result<Self, Error> {
        let option = match code {
            SUBNET_MASK => Self::SubnetMask(addr(value)?),
            ROUTER => Self::Router(addrs(value)?),
            DOMAIN_NAME_SERVER => Self::DomainNameServer(addrs(value)?),
            HOST_NAME => Self::HostName(string(value)?),
            NTP_SERVERS => Self::NtpServers(addrs(value)?),
            REQUESTED_IP_ADDRESS => Self::RequestedIpAddress(addr(value)?),
            IP_ADDRESS_LEASE_TIME => Self::IpAddressLeaseTime(be32(value)?),
            OPTION_OVERLOAD => Self::OptionOverload(single(value)?),
            DHCP_MESSAGE_TYPE => Self::MessageType(
                MessageType::try_from_primitive(single(value)?)
                    .map_err(|_| Error::MalformedOption)?,
            ),
            SERVER_IDENTIFIER => Self::ServerIdentifier(addr(value)?),
            PARAMETER_REQUEST_LIST => Self::ParameterRequestList(value.into()),
            MESSAGE => Self::Message(string(value)?),
            MAX_MESSAGE_SIZE => Self::MaxMessageSize(be16(value)?),
            RENEWAL_TIME => Self::RenewalTime(be32(value)?),
            REBINDING_TIME => Self::RebindingTime(be32(value)?),
            VENDOR_CLASS_IDENTIFIER => Self::VendorClassIdentifier(value.into()),
            CLIENT_IDENTIFIER => Self::ClientIdentifier(value.into()),
            TFTP_SERVER_NAME => Self::TftpServerName(string(value)?),
            BOOT_FILE_NAME => Self::BootFileName(string(value)?),
            USER_CLASS => Self::UserClass(value.into()),
            CLIENT_FQDN => Self::ClientFqdn(value.into()),
            _ => Self::Generic(code, value.into()),
        };

        Ok(option)
    }

    fn value(&self, out: &mut Vec<u8>) {
        match self {
            Self::SubnetMask(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => out.extend_from_slice(&addr.octets()),
            Self::Router(addrs) | Self::DomainNameServer(addrs) | Self::NtpServers(addrs) => {
                for addr in addrs {
                    out.extend_from_slice(&addr.octets());
                }
            }
            Self::HostName(str)
            | Self::Message(str)
            | Self::TftpServerName(str)
            | Self::BootFileName(str) => out.extend_from_slice(str.as_bytes()),
            Self::IpAddressLeaseTime(value)
            | Self::RenewalTime(value)
            | Self::RebindingTime(value) => out.extend_from_slice(&value.to_be_bytes()),
            Self::OptionOverload(value) => out.push(*value),
            Self::MessageType(mt) => out.push(*mt as u8),
            Self::MaxMessageSize(value) => out.extend_from_slice(&value.to_be_bytes()),
            Self::ParameterRequestList(data)
            | Self::VendorClassIdentifier(data)
            | Self::ClientIdentifier(data)
            | Self::UserClass(data)
            | Self::ClientFqdn(data)
            | Self::Generic(_, data) => out.extend_from_slice(data),
        }
    }

    fn encode(&self, out: &mut BytesOut) -> Result<(), Error> {
        let mut value = Vec::new();
        self.value(&mut value);

        if value.is_empty() {
            out.byte(self.code())?.byte(0)?;

            return Ok(());
        }

        // Values longer than a single TLV can carry are split into multiple
        // fragments with the same code; decoders re-concatenate them
        for chunk in value.chunks(u8::MAX as usize) {
            out.byte(self.code())?.byte(chunk.len() as u8)?.push(chunk)?;
        }

        Ok(())
    }
}

/// The ordered option list of a packet.
///
/// Pad, End and Option Overload never appear here; they belong to the framing
/// and are consumed (or produced) by the codec.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Options(Vec<DhcpOption>);

impl Options {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DhcpOption> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, code: u8) -> Option<&DhcpOption> {
        self.0.iter().find(|option| option.code() == code)
    }

    pub fn contains(&self, code: u8) -> bool {
        self.get(code).is_some()
    }

    pub fn push(&mut self, option: DhcpOption) {
        self.0.push(option);
    }

    /// Sets the message type, replacing an already present one rather than
    /// accumulating duplicate entries.
    pub fn set_message_type(&mut self, mt: MessageType) {
        if let Some(option) = self
            .0
            .iter_mut()
            .find(|option| option.code() == DHCP_MESSAGE_TYPE)
        {
            *option = DhcpOption::MessageType(mt);
        } else {
            self.0.push(DhcpOption::MessageType(mt));
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.0.iter().find_map(|option| {
            if let DhcpOption::MessageType(mt) = option {
                Some(*mt)
            } else {
                None
            }
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.0.iter().find_map(|option| {
            if let DhcpOption::ServerIdentifier(addr) = option {
                Some(*addr)
            } else {
                None
            }
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.0.iter().find_map(|option| {
            if let DhcpOption::RequestedIpAddress(addr) = option {
                Some(*addr)
            } else {
                None
            }
        })
    }

    pub fn host_name(&self) -> Option<&str> {
        self.0.iter().find_map(|option| {
            if let DhcpOption::HostName(name) = option {
                Some(name.as_str())
            } else {
                None
            }
        })
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.0.iter().find_map(|option| {
            if let DhcpOption::ClientIdentifier(id) = option {
                Some(id.as_slice())
            } else {
                None
            }
        })
    }

    /// Whether the client listed the given code in its parameter request list.
    pub fn requests(&self, code: u8) -> bool {
        self.0
            .iter()
            .find_map(|option| {
                if let DhcpOption::ParameterRequestList(requested) = option {
                    Some(requested.contains(&code))
                } else {
                    None
                }
            })
            .unwrap_or(false)
    }

    /// Decodes the options area of a packet, reassembling option space
    /// overloaded into the `file`/`sname` header fields.
    pub fn decode(area: &[u8], sname: &[u8], file: &[u8]) -> Result<Self, Error> {
        // One pre-scan of the primary area decides which extra buffers take
        // part in reassembly at all
        let overload = scan_overload(area)?.unwrap_or(0);

        let mut fragments: Vec<(u8, Vec<u8>)> = Vec::new();

        collect_fragments(area, &mut fragments)?;

        if overload & OVERLOAD_FILE != 0 {
            collect_fragments(file, &mut fragments)?;
        }

        if overload & OVERLOAD_SNAME != 0 {
            collect_fragments(sname, &mut fragments)?;
        }

        let mut options = Vec::with_capacity(fragments.len());

        for (code, value) in fragments {
            options.push(DhcpOption::decode_value(code, &value)?);
        }

        Ok(Self(options))
    }

    pub(crate) fn encode(&self, out: &mut BytesOut) -> Result<(), Error> {
        // Relay agent information must stay the last option before End
        for option in self
            .0
            .iter()
            .filter(|option| option.code() != RELAY_AGENT_INFORMATION)
        {
            option.encode(out)?;
        }

        for option in self
            .0
            .iter()
            .filter(|option| option.code() == RELAY_AGENT_INFORMATION)
        {
            option.encode(out)?;
        }

        Ok(())
    }
}

impl From<Vec<DhcpOption>> for Options {
    fn from(options: Vec<DhcpOption>) -> Self {
        Self(options)
    }
}

impl<'a> IntoIterator for &'a Options {
    type Item = &'a DhcpOption;
    type IntoIter = core::slice::Iter<'a, DhcpOption>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Walks the TLV stream looking for the Option Overload option only.
fn scan_overload(area: &[u8]) -> Result<Option<u8>, Error> {
    let mut bytes = BytesIn::new(area);

    while !bytes.is_empty() {
        let code = bytes.byte()?;

        match code {
            PAD => continue,
            END => break,
            _ => (),
        }

        let len = bytes.byte().map_err(|_| Error::MalformedOption)? as usize;
        let value = bytes.slice(len).map_err(|_| Error::MalformedOption)?;

        if code == OPTION_OVERLOAD {
            if value.len() != 1 {
                Err(Error::MalformedOption)?;
            }

            return Ok(Some(value[0]));
        }
    }

    Ok(None)
}

/// Collects the TLV fragments of one buffer into the shared accumulator,
/// concatenating fragments whose code was already seen. A missing End is
/// tolerated; the stream simply runs out.
fn collect_fragments(buf: &[u8], fragments: &mut Vec<(u8, Vec<u8>)>) -> Result<(), Error> {
    let mut bytes = BytesIn::new(buf);

    while !bytes.is_empty() {
        let code = bytes.byte()?;

        match code {
            PAD => continue,
            END => break,
            _ => (),
        }

        let len = bytes.byte().map_err(|_| Error::MalformedOption)? as usize;
        let value = bytes.slice(len).map_err(|_| Error::MalformedOption)?;

        // Consumed during reassembly; never part of the decoded list
        if code == OPTION_OVERLOAD {
            continue;
        }

        if let Some((_, existing)) = fragments.iter_mut().find(|(existing, _)| *existing == code) {
            existing.extend_from_slice(value);
        } else {
            fragments.push((code, value.into()));
        }
    }

    Ok(())
}

fn addr(value: &[u8]) -> Result<Ipv4Addr, Error> {
    let octets: [u8; 4] = value.try_into().map_err(|_| Error::MalformedOption)?;

    Ok(octets.into())
}

fn addrs(value: &[u8]) -> Result<Vec<Ipv4Addr>, Error> {
    if value.is_empty() || value.len() % 4 != 0 {
        Err(Error::MalformedOption)?;
    }

    Ok(value
        .chunks(4)
        .map(|octets| {
            let octets: [u8; 4] = octets.try_into().unwrap();

            octets.into()
        })
        .collect())
}

fn string(value: &[u8]) -> Result<String, Error> {
    core::str::from_utf8(value)
        .map(Into::into)
        .map_err(Error::InvalidUtf8Str)
}

fn be16(value: &[u8]) -> Result<u16, Error> {
    let bytes: [u8; 2] = value.try_into().map_err(|_| Error::MalformedOption)?;

    Ok(u16::from_be_bytes(bytes))
}

fn be32(value: &[u8]) -> Result<u32, Error> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| Error::MalformedOption)?;

    Ok(u32::from_be_bytes(bytes))
}

fn single(value: &[u8]) -> Result<u8, Error> {
    if value.len() != 1 {
        Err(Error::MalformedOption)?;
    }

    Ok(value[0])
}

#[cfg(test)]
mod test {
    use super::*;

    use alloc::vec;

    fn decode(area: &[u8]) -> Options {
        Options::decode(area, &[0; 64], &[0; 128]).unwrap()
    }

    #[test]
    fn typed_and_generic_options() {
        let options = decode(&[
            53, 1, 1, // DISCOVER
            1, 4, 255, 255, 255, 0, // subnet mask
            6, 8, 8, 8, 8, 8, 8, 8, 4, 4, // two name servers
            150, 2, 0xab, 0xcd, // unknown code
            255,
        ]);

        assert_eq!(options.message_type(), Some(MessageType::Discover));
        assert_eq!(
            options.get(SUBNET_MASK),
            Some(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)))
        );
        assert_eq!(
            options.get(DOMAIN_NAME_SERVER),
            Some(&DhcpOption::DomainNameServer(vec![
                Ipv4Addr::new(8, 8, 8, 8),
                Ipv4Addr::new(8, 8, 4, 4)
            ]))
        );
        assert_eq!(
            options.get(150),
            Some(&DhcpOption::Generic(150, vec![0xab, 0xcd]))
        );
    }

    #[test]
    fn pads_are_skipped_and_a_missing_end_is_tolerated() {
        let options = decode(&[0, 0, 53, 1, 2, 0, 54, 4, 10, 0, 0, 1]);

        assert_eq!(options.message_type(), Some(MessageType::Offer));
        assert_eq!(
            options.server_identifier(),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn same_code_fragments_concatenate() {
        // The parameter request list arrives split over two TLVs
        let options = decode(&[55, 2, 1, 3, 53, 1, 1, 55, 1, 6, 255]);

        assert_eq!(
            options.get(PARAMETER_REQUEST_LIST),
            Some(&DhcpOption::ParameterRequestList(vec![1, 3, 6]))
        );
        assert_eq!(options.len(), 2);
    }

    #[test]
    fn overloaded_fields_decode_like_inline_options() {
        let mut sname = [0; 64];
        sname[..6].copy_from_slice(&[12, 4, b'm', b'e', b'm', b'o']);

        let mut file = [0; 128];
        file[..7].copy_from_slice(&[54, 4, 10, 0, 0, 1, 255]);

        let overloaded = Options::decode(&[53, 1, 1, 52, 1, 3, 255], &sname, &file).unwrap();
        let inline = decode(&[53, 1, 1, 54, 4, 10, 0, 0, 1, 12, 4, b'm', b'e', b'm', b'o', 255]);

        assert_eq!(overloaded.len(), 3);
        assert_eq!(overloaded.message_type(), inline.message_type());
        assert_eq!(overloaded.server_identifier(), inline.server_identifier());
        assert_eq!(overloaded.host_name(), inline.host_name());
    }

    #[test]
    fn overload_is_honored_per_field() {
        let mut sname = [0; 64];
        sname[..6].copy_from_slice(&[12, 4, b'm', b'e', b'm', b'o']);

        // Only `file` is marked as overloaded, so `sname` stays a host name field
        let options = Options::decode(&[53, 1, 1, 52, 1, 1, 255], &sname, &[0; 128]).unwrap();

        assert_eq!(options.len(), 1);
        assert_eq!(options.host_name(), None);
    }

    #[test]
    fn overload_with_a_bad_length_is_rejected() {
        assert!(matches!(
            Options::decode(&[52, 2, 1, 1, 255], &[0; 64], &[0; 128]),
            Err(Error::MalformedOption)
        ));
    }

    #[test]
    fn long_values_split_and_reassemble() {
        let blob: Vec<u8> = (0..400u16).map(|byte| byte as u8).collect();

        let mut options = Options::new();
        options.push(DhcpOption::Generic(150, blob.clone()));

        let mut buf = [0; 1024];
        let len = {
            let mut out = BytesOut::new(&mut buf);
            options.encode(&mut out).unwrap();
            out.byte(END).unwrap();
            out.len()
        };

        // Two fragments on the wire (255 + 145)
        assert_eq!(buf[0], 150);
        assert_eq!(buf[1], 255);
        assert_eq!(buf[257], 150);
        assert_eq!(buf[258], 145);

        let decoded = decode(&buf[..len]);
        assert_eq!(decoded.get(150), Some(&DhcpOption::Generic(150, blob)));
    }

    #[test]
    fn relay_agent_information_is_emitted_last() {
        let mut options = Options::new();
        options.push(DhcpOption::Generic(RELAY_AGENT_INFORMATION, vec![1, 2]));
        options.set_message_type(MessageType::Ack);

        let mut buf = [0; 64];
        let len = {
            let mut out = BytesOut::new(&mut buf);
            options.encode(&mut out).unwrap();
            out.len()
        };

        assert_eq!(&buf[..len], &[53, 1, 5, 82, 2, 1, 2]);
    }

    #[test]
    fn message_type_setter_replaces() {
        let mut options = Options::new();
        options.set_message_type(MessageType::Offer);
        options.set_message_type(MessageType::Ack);

        assert_eq!(options.len(), 1);
        assert_eq!(options.message_type(), Some(MessageType::Ack));
    }
}
