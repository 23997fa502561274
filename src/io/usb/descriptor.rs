// ============================================================================
// src/io/usb/descriptor.rs - USB Descriptors
// ============================================================================
//!
//! # USB ディスクリプタ
//!
//! 列挙時に取得する標準ディスクリプタ（Device / Configuration /
//! Interface / Endpoint）のパース。
//!
//! パック構造体へのキャストは行わず、リトルエンディアンのバイト列から
//! フィールドを一つずつ読み出す。

use alloc::vec::Vec;

// ============================================================================
// Descriptor Types
// ============================================================================

/// ディスクリプタタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    InterfaceAssociation = 11,
    Bos = 15,
    Hid = 0x21,
    SuperSpeedEndpointCompanion = 48,
}

impl DescriptorType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(DescriptorType::Device),
            2 => Some(DescriptorType::Configuration),
            3 => Some(DescriptorType::String),
            4 => Some(DescriptorType::Interface),
            5 => Some(DescriptorType::Endpoint),
            6 => Some(DescriptorType::DeviceQualifier),
            11 => Some(DescriptorType::InterfaceAssociation),
            15 => Some(DescriptorType::Bos),
            0x21 => Some(DescriptorType::Hid),
            48 => Some(DescriptorType::SuperSpeedEndpointCompanion),
            _ => None,
        }
    }
}

/// インターフェースクラスコード
pub mod class_code {
    pub const HID: u8 = 0x03;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
}

/// HID サブクラス / プロトコル
pub mod hid {
    pub const SUBCLASS_BOOT: u8 = 0x01;
    pub const PROTOCOL_KEYBOARD: u8 = 0x01;
    pub const PROTOCOL_MOUSE: u8 = 0x02;
}

// ============================================================================
// Parsing Trait
// ============================================================================

/// バイト列からのディスクリプタ読み取り
pub trait FromDescriptorBytes: Sized {
    /// bLength の最小値
    const LENGTH: usize;
    /// bDescriptorType
    const TYPE: DescriptorType;

    /// 長さと種別を検証済みのバイト列から構築
    fn decode(data: &[u8]) -> Self;

    /// 長さと種別を検証してパース
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LENGTH || (data[0] as usize) < Self::LENGTH {
            return None;
        }
        if data[1] != Self::TYPE as u8 {
            return None;
        }
        Some(Self::decode(data))
    }
}

fn le16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

// ============================================================================
// Device Descriptor
// ============================================================================

/// デバイスディスクリプタ (18バイト)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    /// USB仕様バージョン (BCD)
    pub bcd_usb: u16,
    /// デバイスクラス
    pub b_device_class: u8,
    /// デバイスサブクラス
    pub b_device_sub_class: u8,
    /// デバイスプロトコル
    pub b_device_protocol: u8,
    /// 最大パケットサイズ (EP0)
    pub b_max_packet_size0: u8,
    /// ベンダーID
    pub id_vendor: u16,
    /// プロダクトID
    pub id_product: u16,
    /// デバイスバージョン (BCD)
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    /// コンフィグレーション数
    pub b_num_configurations: u8,
}

impl FromDescriptorBytes for DeviceDescriptor {
    const LENGTH: usize = 18;
    const TYPE: DescriptorType = DescriptorType::Device;

    fn decode(data: &[u8]) -> Self {
        Self {
            bcd_usb: le16(data, 2),
            b_device_class: data[4],
            b_device_sub_class: data[5],
            b_device_protocol: data[6],
            b_max_packet_size0: data[7],
            id_vendor: le16(data, 8),
            id_product: le16(data, 10),
            bcd_device: le16(data, 12),
            i_manufacturer: data[14],
            i_product: data[15],
            i_serial_number: data[16],
            b_num_configurations: data[17],
        }
    }
}

impl DeviceDescriptor {
    /// USB バージョン (major, minor)
    pub fn usb_version(&self) -> (u8, u8) {
        ((self.bcd_usb >> 8) as u8, (self.bcd_usb & 0xFF) as u8)
    }
}

// ============================================================================
// Configuration Descriptor
// ============================================================================

/// コンフィグレーションディスクリプタ (9バイト)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ConfigurationDescriptor {
    /// 合計長さ
    pub w_total_length: u16,
    /// インターフェース数
    pub b_num_interfaces: u8,
    /// コンフィグレーション値
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    /// 属性
    pub bm_attributes: u8,
    /// 最大電力 (2mA単位)
    pub b_max_power: u8,
}

impl FromDescriptorBytes for ConfigurationDescriptor {
    const LENGTH: usize = 9;
    const TYPE: DescriptorType = DescriptorType::Configuration;

    fn decode(data: &[u8]) -> Self {
        Self {
            w_total_length: le16(data, 2),
            b_num_interfaces: data[4],
            b_configuration_value: data[5],
            i_configuration: data[6],
            bm_attributes: data[7],
            b_max_power: data[8],
        }
    }
}

impl ConfigurationDescriptor {
    pub fn is_self_powered(&self) -> bool {
        (self.bm_attributes & 0x40) != 0
    }

    pub fn max_power_ma(&self) -> u16 {
        self.b_max_power as u16 * 2
    }
}

// ============================================================================
// Interface Descriptor
// ============================================================================

/// インターフェースディスクリプタ (9バイト)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct InterfaceDescriptor {
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

impl FromDescriptorBytes for InterfaceDescriptor {
    const LENGTH: usize = 9;
    const TYPE: DescriptorType = DescriptorType::Interface;

    fn decode(data: &[u8]) -> Self {
        Self {
            b_interface_number: data[2],
            b_alternate_setting: data[3],
            b_num_endpoints: data[4],
            b_interface_class: data[5],
            b_interface_sub_class: data[6],
            b_interface_protocol: data[7],
            i_interface: data[8],
        }
    }
}

impl InterfaceDescriptor {
    /// HID ブートプロトコルキーボードか
    pub fn is_hid_boot_keyboard(&self) -> bool {
        self.b_interface_class == class_code::HID
            && self.b_interface_sub_class == hid::SUBCLASS_BOOT
            && self.b_interface_protocol == hid::PROTOCOL_KEYBOARD
    }
}

// ============================================================================
// Endpoint Descriptor
// ============================================================================

/// エンドポイント転送タイプ (bmAttributes bits 1:0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// エンドポイントディスクリプタ (7バイト)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct EndpointDescriptor {
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl FromDescriptorBytes for EndpointDescriptor {
    const LENGTH: usize = 7;
    const TYPE: DescriptorType = DescriptorType::Endpoint;

    fn decode(data: &[u8]) -> Self {
        Self {
            b_endpoint_address: data[2],
            bm_attributes: data[3],
            w_max_packet_size: le16(data, 4),
            b_interval: data[6],
        }
    }
}

impl EndpointDescriptor {
    pub fn endpoint_number(&self) -> u8 {
        self.b_endpoint_address & 0x0F
    }

    pub fn is_in(&self) -> bool {
        (self.b_endpoint_address & 0x80) != 0
    }

    pub fn kind(&self) -> EndpointKind {
        match self.bm_attributes & 0x3 {
            0 => EndpointKind::Control,
            1 => EndpointKind::Isochronous,
            2 => EndpointKind::Bulk,
            _ => EndpointKind::Interrupt,
        }
    }

    pub fn max_packet_size(&self) -> u16 {
        self.w_max_packet_size & 0x7FF
    }
}

// ============================================================================
// Configuration Parsing
// ============================================================================

/// パースされたコンフィグレーション
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConfiguration {
    pub config: ConfigurationDescriptor,
    pub interfaces: Vec<ParsedInterface>,
}

/// パースされたインターフェース
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInterface {
    pub interface: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl ParsedConfiguration {
    /// HID ブートキーボードのインターフェースを探す
    pub fn find_boot_keyboard(&self) -> Option<&ParsedInterface> {
        self.interfaces.iter().find(|i| i.interface.is_hid_boot_keyboard())
    }
}

/// コンフィグレーションディスクリプタ一式をパース
///
/// `data` が wTotalLength より短い場合（読み取りバッファ上限で切れた場合）は
/// 読めた範囲までを返す。
pub fn parse_configuration(data: &[u8]) -> Option<ParsedConfiguration> {
    let config = ConfigurationDescriptor::from_bytes(data)?;
    let end = (config.w_total_length as usize).min(data.len());

    let mut interfaces = Vec::new();
    let mut current: Option<ParsedInterface> = None;
    let mut offset = data[0] as usize;

    while offset + 2 <= end {
        let length = data[offset] as usize;
        if length < 2 || offset + length > end {
            break;
        }
        let body = &data[offset..offset + length];

        match DescriptorType::from_u8(body[1]) {
            Some(DescriptorType::Interface) => {
                if let Some(iface) = current.take() {
                    interfaces.push(iface);
                }
                current = InterfaceDescriptor::from_bytes(body).map(|interface| ParsedInterface {
                    interface,
                    endpoints: Vec::new(),
                });
            }
            Some(DescriptorType::Endpoint) => {
                if let (Some(iface), Some(endpoint)) =
                    (current.as_mut(), EndpointDescriptor::from_bytes(body))
                {
                    iface.endpoints.push(endpoint);
                }
            }
            // HID / SS companion などは読み飛ばす
            _ => {}
        }

        offset += length;
    }

    if let Some(iface) = current {
        interfaces.push(iface);
    }

    Some(ParsedConfiguration { config, interfaces })
}
