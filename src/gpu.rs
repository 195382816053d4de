//! Pairing of GPU video and audio PCI functions.
//!
//! A passthrough-capable GPU usually exposes two functions on the same
//! physical slot: the VGA controller and an HDMI audio device. Both must be
//! handed to the guest together, so discovery works in pairs: for each known
//! vendor pattern the bus listing is scanned for a video match and an audio
//! match that share the `BB:DD` bus-slot prefix.

use std::fmt;

use regex::Regex;

use crate::devices::{self, PciDeviceRecord};
use crate::error::Result;

/// Vendor-specific match patterns, applied to the raw listing text.
/// Vendor strings are matched case-sensitively.
pub struct VendorPattern {
    pub video: Regex,
    pub audio: Regex,
}

impl VendorPattern {
    fn new(video: &str, audio: &str) -> VendorPattern {
        VendorPattern {
            video: Regex::new(video).expect("video vendor pattern is valid"),
            audio: Regex::new(audio).expect("audio vendor pattern is valid"),
        }
    }
}

pub fn default_vendor_patterns() -> Vec<VendorPattern> {
    vec![
        VendorPattern::new("(.*VGA.*NVIDIA|.*NVIDIA.*GeForce)", "(Audio device.*NVIDIA|NVIDIA Corporation)"),
        VendorPattern::new("(.*VGA.*AMD|.*AMD.*Radeon)", "(Audio device.*AMD|Advanced Micro Devices)"),
    ]
}

/// One physical GPU, described by its passthrough addresses.
///
/// The video function is mandatory; some cards present no audio function.
/// When the audio function is present it lives on the same bus slot as the
/// video function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDescriptor {
    pub video_address: String,
    pub audio_address: Option<String>,
    pub video_vendor: String,
    pub audio_vendor: Option<String>,
}

impl GpuDescriptor {
    fn from_records(video: &PciDeviceRecord, audio: Option<&PciDeviceRecord>) -> GpuDescriptor {
        GpuDescriptor {
            video_address: video.full_address(),
            audio_address: audio.map(|a| a.full_address()),
            video_vendor: video.description.clone(),
            audio_vendor: audio.map(|a| a.description.clone()),
        }
    }
}

impl fmt::Display for GpuDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} video-address: [{}]", self.video_vendor, self.video_address)
    }
}

/// Pair video and audio functions across the scanned records.
///
/// For each vendor pattern, one scan finds a video candidate (VGA controller
/// marker + video pattern) and an audio candidate (audio device marker +
/// audio pattern). Whichever role matches first locks the bus-slot prefix;
/// the remaining role only accepts records on the same slot, which is what
/// keeps both functions on one physical card. Matched records are removed
/// and the pattern is applied again, so multi-GPU hosts yield one
/// descriptor per card. Output order is discovery order.
pub fn pair_gpus(records: &[PciDeviceRecord], vendors: &[VendorPattern]) -> Vec<GpuDescriptor> {
    let mut working: Vec<PciDeviceRecord> = records.to_vec();
    let mut gpus = Vec::new();

    for vendor in vendors {
        while let Some((video, audio)) = find_pair(&working, vendor) {
            let video_rec = working[video].clone();
            let audio_rec = audio.map(|i| working[i].clone());
            gpus.push(GpuDescriptor::from_records(&video_rec, audio_rec.as_ref()));

            let mut remove: Vec<usize> = Some(video).into_iter().chain(audio).collect();
            remove.sort_unstable_by(|a, b| b.cmp(a));
            for index in remove {
                working.remove(index);
            }
        }
    }
    gpus
}

/// A video match with no audio counterpart is still a usable GPU; no video
/// match means the vendor pattern contributes nothing.
fn find_pair(records: &[PciDeviceRecord], vendor: &VendorPattern) -> Option<(usize, Option<usize>)> {
    let mut video: Option<usize> = None;
    let mut audio: Option<usize> = None;
    let mut slot: Option<String> = None;

    for (index, record) in records.iter().enumerate() {
        let same_slot = slot.as_deref().map_or(true, |s| s == record.bus_slot());
        if !same_slot {
            continue;
        }
        if video.is_none() && record.is_vga_controller() && vendor.video.is_match(&record.description) {
            video = Some(index);
            slot.get_or_insert_with(|| record.bus_slot().to_string());
        } else if audio.is_none() && record.is_audio_device() && vendor.audio.is_match(&record.description) {
            audio = Some(index);
            slot.get_or_insert_with(|| record.bus_slot().to_string());
        }
        if video.is_some() && audio.is_some() {
            break;
        }
    }

    video.map(|v| (v, audio))
}

/// Scan the IOMMU groups and pair everything the default vendor patterns
/// recognize.
pub fn discover_gpus() -> Result<Vec<GpuDescriptor>> {
    let records = devices::list_iommu_devices()?;
    Ok(pair_gpus(&records, &default_vendor_patterns()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(line: &str) -> PciDeviceRecord {
        PciDeviceRecord::parse(line).expect("test listing line parses")
    }

    fn nvidia_records() -> Vec<PciDeviceRecord> {
        vec![
            record("01:00.0 VGA compatible controller [0300]: NVIDIA Corporation GP104 [GeForce GTX 1080] [10de:1b80] (rev a1)"),
            record("01:00.1 Audio device [0403]: NVIDIA Corporation GP104 High Definition Audio Controller [10de:10f0] (rev a1)"),
        ]
    }

    #[test]
    fn pairs_video_and_audio_of_one_card() {
        let gpus = pair_gpus(&nvidia_records(), &default_vendor_patterns());
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].video_address, "0000:01:00.0");
        assert_eq!(gpus[0].audio_address.as_deref(), Some("0000:01:00.1"));
    }

    #[test]
    fn paired_functions_always_share_the_bus_slot_prefix() {
        // the audio function on 02:00 belongs to a different card and must
        // not be paired with the video function on 01:00
        let records = vec![
            record("01:00.0 VGA compatible controller [0300]: NVIDIA Corporation GP104 [GeForce GTX 1080] [10de:1b80] (rev a1)"),
            record("02:00.1 Audio device [0403]: NVIDIA Corporation GP102 High Definition Audio Controller [10de:10ef] (rev a1)"),
        ];
        let gpus = pair_gpus(&records, &default_vendor_patterns());
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].video_address, "0000:01:00.0");
        assert_eq!(gpus[0].audio_address, None);
        for gpu in &gpus {
            if let Some(audio) = &gpu.audio_address {
                assert_eq!(&gpu.video_address[..10], &audio[..10]);
            }
        }
    }

    #[test]
    fn video_without_audio_yields_a_descriptor() {
        let records = vec![record(
            "05:00.0 VGA compatible controller [0300]: NVIDIA Corporation GP107 [GeForce GTX 1050 Ti] [10de:1c82] (rev a1)",
        )];
        let gpus = pair_gpus(&records, &default_vendor_patterns());
        assert_eq!(gpus.len(), 1);
        assert!(gpus[0].audio_address.is_none());
        assert!(gpus[0].audio_vendor.is_none());
    }

    #[test]
    fn audio_alone_is_not_a_gpu() {
        let records = vec![record(
            "01:00.1 Audio device [0403]: NVIDIA Corporation GP104 High Definition Audio Controller [10de:10f0] (rev a1)",
        )];
        assert!(pair_gpus(&records, &default_vendor_patterns()).is_empty());
    }

    #[test]
    fn unmatched_vendor_contributes_nothing() {
        let records = vec![record(
            "00:02.0 VGA compatible controller [0300]: Intel Corporation UHD Graphics 630 [8086:3e92]",
        )];
        assert!(pair_gpus(&records, &default_vendor_patterns()).is_empty());
    }

    #[test]
    fn multiple_cards_of_one_vendor_all_pair_up() {
        let records = vec![
            record("01:00.0 VGA compatible controller [0300]: NVIDIA Corporation GP104 [GeForce GTX 1080] [10de:1b80] (rev a1)"),
            record("01:00.1 Audio device [0403]: NVIDIA Corporation GP104 High Definition Audio Controller [10de:10f0] (rev a1)"),
            record("02:00.0 VGA compatible controller [0300]: NVIDIA Corporation GP102 [GeForce GTX 1080 Ti] [10de:1b06] (rev a1)"),
            record("02:00.1 Audio device [0403]: NVIDIA Corporation GP102 High Definition Audio Controller [10de:10ef] (rev a1)"),
        ];
        let gpus = pair_gpus(&records, &default_vendor_patterns());
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].video_address, "0000:01:00.0");
        assert_eq!(gpus[0].audio_address.as_deref(), Some("0000:01:00.1"));
        assert_eq!(gpus[1].video_address, "0000:02:00.0");
        assert_eq!(gpus[1].audio_address.as_deref(), Some("0000:02:00.1"));
    }

    #[test]
    fn non_gpu_records_are_ignored() {
        let mut records = nvidia_records();
        records.push(record(
            "00:1f.3 Audio device [0403]: Intel Corporation Cannon Lake PCH cAVS [8086:a348] (rev 10)",
        ));
        records.push(record(
            "00:17.0 SATA controller [0106]: Intel Corporation Cannon Lake PCH SATA AHCI Controller [8086:a352] (rev 10)",
        ));
        let gpus = pair_gpus(&records, &default_vendor_patterns());
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].video_address, "0000:01:00.0");
    }
}
