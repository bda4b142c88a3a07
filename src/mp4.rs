use anyhow::{Context, Result, bail};
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Presentation time base: 1/1000 s, matching the millisecond timestamps the
/// engine attaches to frames.
pub const TIMESCALE: u32 = 1000;

/// Progressive MP4 writer for one H.264 segment.
///
/// Layout is `ftyp` + `mdat` + trailing `moov`; samples append to `mdat` as
/// they are encoded and the index is emitted once at finalisation. Until the
/// `moov` lands the file is not playable, which is exactly what the recovery
/// metadata's `finalized` flag records after a crash.
pub struct Mp4SegmentWriter {
    file: File,
    path: PathBuf,
    width: u32,
    height: u32,
    default_duration_ms: u64,
    mdat_offset: u64,
    mdat_payload_start: u64,
    data_len: u64,
    sample_sizes: Vec<u32>,
    sample_times_ms: Vec<u64>,
    sync_samples: Vec<u32>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    finalized: bool,
}

impl Mp4SegmentWriter {
    pub fn create(path: &Path, width: u32, height: u32, default_duration_ms: u64) -> Result<Self> {
        let mut file = File::create(path)
            .with_context(|| format!("failed to create segment file {}", path.display()))?;

        let mut ftyp = BytesMut::with_capacity(32);
        ftyp.put_u32(32);
        ftyp.put_slice(b"ftyp");
        ftyp.put_slice(b"isom");
        ftyp.put_u32(0x200);
        ftyp.put_slice(b"isom");
        ftyp.put_slice(b"iso2");
        ftyp.put_slice(b"avc1");
        ftyp.put_slice(b"mp41");
        file.write_all(&ftyp)?;

        let mdat_offset = ftyp.len() as u64;
        let mut mdat = BytesMut::with_capacity(8);
        mdat.put_u32(8); // patched at finalisation
        mdat.put_slice(b"mdat");
        file.write_all(&mdat)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            width,
            height,
            default_duration_ms: default_duration_ms.max(1),
            mdat_offset,
            mdat_payload_start: mdat_offset + 8,
            data_len: 0,
            sample_sizes: Vec::new(),
            sample_times_ms: Vec::new(),
            sync_samples: Vec::new(),
            sps: None,
            pps: None,
            finalized: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_sizes.len() as u32
    }

    pub fn sync_sample_count(&self) -> usize {
        self.sync_samples.len()
    }

    pub fn last_sample_time_ms(&self) -> Option<u64> {
        self.sample_times_ms.last().copied()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Appends one encoded frame. `annexb` is the encoder's Annex-B output;
    /// parameter sets are lifted into the sample description and VCL/SEI
    /// units are stored length-prefixed. `ts_ms` is relative to the first
    /// frame of the segment and is clamped to keep sample times
    /// non-decreasing.
    pub fn append_sample(&mut self, annexb: &[u8], ts_ms: u64) -> Result<()> {
        if self.finalized {
            bail!("segment already finalized");
        }

        let mut sample = BytesMut::new();
        let mut keyframe = false;
        for nal in split_annexb(annexb) {
            if nal.is_empty() {
                continue;
            }
            match nal[0] & 0x1F {
                7 => self.sps = Some(nal.to_vec()),
                8 => self.pps = Some(nal.to_vec()),
                9 => {}
                nal_type => {
                    if nal_type == 5 {
                        keyframe = true;
                    }
                    sample.put_u32(nal.len() as u32);
                    sample.put_slice(nal);
                }
            }
        }
        if sample.is_empty() {
            return Ok(());
        }

        let ts = match self.sample_times_ms.last() {
            Some(&last) => ts_ms.max(last),
            None => ts_ms,
        };

        self.file.write_all(&sample)?;
        self.data_len += sample.len() as u64;
        self.sample_sizes.push(sample.len() as u32);
        self.sample_times_ms.push(ts);
        if keyframe {
            self.sync_samples.push(self.sample_count());
        }
        Ok(())
    }

    /// Patches the `mdat` size and writes the `moov`, making the file
    /// playable. Idempotent once it has succeeded.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if self.sample_sizes.is_empty() {
            bail!("segment has no samples");
        }
        let (Some(sps), Some(pps)) = (self.sps.clone(), self.pps.clone()) else {
            bail!("no parameter sets seen; segment is not decodable");
        };

        let mdat_size = 8 + self.data_len;
        if mdat_size > u32::MAX as u64 || self.mdat_payload_start > u32::MAX as u64 {
            bail!("segment exceeds 32-bit box limits");
        }
        self.file.seek(SeekFrom::Start(self.mdat_offset))?;
        self.file.write_all(&(mdat_size as u32).to_be_bytes())?;
        self.file.seek(SeekFrom::End(0))?;

        let moov = self.build_moov(&sps, &pps);
        self.file.write_all(&moov)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.finalized = true;
        Ok(())
    }

    /// Deletes the partial file; used on writer failure or cancel.
    pub fn abort(self) {
        let _ = std::fs::remove_file(&self.path);
    }

    fn sample_durations(&self) -> Vec<u32> {
        let mut durations = Vec::with_capacity(self.sample_times_ms.len());
        for pair in self.sample_times_ms.windows(2) {
            durations.push((pair[1] - pair[0]) as u32);
        }
        let last = durations
            .last()
            .copied()
            .unwrap_or(self.default_duration_ms as u32)
            .max(1);
        durations.push(last);
        durations
    }

    fn build_moov(&self, sps: &[u8], pps: &[u8]) -> BytesMut {
        let durations = self.sample_durations();
        let total_duration: u64 = durations.iter().map(|&d| d as u64).sum();
        let duration32 = total_duration.min(u32::MAX as u64) as u32;

        let mut mvhd = BytesMut::new();
        mvhd.put_u32(0); // version + flags
        mvhd.put_u32(0); // creation
        mvhd.put_u32(0); // modification
        mvhd.put_u32(TIMESCALE);
        mvhd.put_u32(duration32);
        mvhd.put_u32(0x00010000); // rate 1.0
        mvhd.put_u16(0x0100); // volume
        mvhd.put_u16(0);
        mvhd.put_u32(0);
        mvhd.put_u32(0);
        put_identity_matrix(&mut mvhd);
        for _ in 0..6 {
            mvhd.put_u32(0);
        }
        mvhd.put_u32(2); // next track id

        let mut tkhd = BytesMut::new();
        tkhd.put_u32(0x0000_0003); // version 0, enabled | in_movie
        tkhd.put_u32(0);
        tkhd.put_u32(0);
        tkhd.put_u32(1); // track id
        tkhd.put_u32(0);
        tkhd.put_u32(duration32);
        tkhd.put_u32(0);
        tkhd.put_u32(0);
        tkhd.put_u16(0); // layer
        tkhd.put_u16(0); // alternate group
        tkhd.put_u16(0); // volume (video)
        tkhd.put_u16(0);
        put_identity_matrix(&mut tkhd);
        tkhd.put_u32(self.width << 16);
        tkhd.put_u32(self.height << 16);

        let mut mdhd = BytesMut::new();
        mdhd.put_u32(0);
        mdhd.put_u32(0);
        mdhd.put_u32(0);
        mdhd.put_u32(TIMESCALE);
        mdhd.put_u32(duration32);
        mdhd.put_u16(0x55C4); // "und"
        mdhd.put_u16(0);

        let mut hdlr = BytesMut::new();
        hdlr.put_u32(0);
        hdlr.put_u32(0);
        hdlr.put_slice(b"vide");
        for _ in 0..3 {
            hdlr.put_u32(0);
        }
        hdlr.put_slice(b"VideoHandler\0");

        let mut vmhd = BytesMut::new();
        vmhd.put_u32(1); // flags=1 per spec
        vmhd.put_u16(0);
        for _ in 0..3 {
            vmhd.put_u16(0);
        }

        let mut url = BytesMut::new();
        url.put_u32(1); // self-contained
        let url_box = boxed(b"url ", &url);

        let mut dref = BytesMut::new();
        dref.put_u32(0);
        dref.put_u32(1);
        dref.put_slice(&url_box);
        let dinf = boxed(b"dinf", &boxed(b"dref", &dref));

        let avcc = self.build_avcc(sps, pps);
        let mut avc1 = BytesMut::new();
        for _ in 0..6 {
            avc1.put_u8(0);
        }
        avc1.put_u16(1); // data reference index
        avc1.put_u16(0);
        avc1.put_u16(0);
        for _ in 0..3 {
            avc1.put_u32(0);
        }
        avc1.put_u16(self.width as u16);
        avc1.put_u16(self.height as u16);
        avc1.put_u32(0x0048_0000); // 72 dpi
        avc1.put_u32(0x0048_0000);
        avc1.put_u32(0);
        avc1.put_u16(1); // frames per sample
        for _ in 0..32 {
            avc1.put_u8(0); // compressor name
        }
        avc1.put_u16(0x0018); // depth
        avc1.put_u16(0xFFFF); // pre_defined -1
        avc1.put_slice(&boxed(b"avcC", &avcc));

        let mut stsd = BytesMut::new();
        stsd.put_u32(0);
        stsd.put_u32(1);
        stsd.put_slice(&boxed(b"avc1", &avc1));

        let mut stts = BytesMut::new();
        stts.put_u32(0);
        let runs = run_length(&durations);
        stts.put_u32(runs.len() as u32);
        for (count, delta) in runs {
            stts.put_u32(count);
            stts.put_u32(delta);
        }

        let mut stss = BytesMut::new();
        stss.put_u32(0);
        stss.put_u32(self.sync_samples.len() as u32);
        for &sample in &self.sync_samples {
            stss.put_u32(sample);
        }

        let mut stsc = BytesMut::new();
        stsc.put_u32(0);
        stsc.put_u32(1);
        stsc.put_u32(1); // first chunk
        stsc.put_u32(self.sample_count()); // samples per chunk
        stsc.put_u32(1); // sample description

        let mut stsz = BytesMut::new();
        stsz.put_u32(0);
        stsz.put_u32(0); // per-sample sizes follow
        stsz.put_u32(self.sample_count());
        for &size in &self.sample_sizes {
            stsz.put_u32(size);
        }

        let mut stco = BytesMut::new();
        stco.put_u32(0);
        stco.put_u32(1);
        stco.put_u32(self.mdat_payload_start as u32);

        let mut stbl = BytesMut::new();
        stbl.put_slice(&boxed(b"stsd", &stsd));
        stbl.put_slice(&boxed(b"stts", &stts));
        stbl.put_slice(&boxed(b"stss", &stss));
        stbl.put_slice(&boxed(b"stsc", &stsc));
        stbl.put_slice(&boxed(b"stsz", &stsz));
        stbl.put_slice(&boxed(b"stco", &stco));

        let mut minf = BytesMut::new();
        minf.put_slice(&boxed(b"vmhd", &vmhd));
        minf.put_slice(&dinf);
        minf.put_slice(&boxed(b"stbl", &stbl));

        let mut mdia = BytesMut::new();
        mdia.put_slice(&boxed(b"mdhd", &mdhd));
        mdia.put_slice(&boxed(b"hdlr", &hdlr));
        mdia.put_slice(&boxed(b"minf", &minf));

        let mut trak = BytesMut::new();
        trak.put_slice(&boxed(b"tkhd", &tkhd));
        trak.put_slice(&boxed(b"mdia", &mdia));

        let mut moov = BytesMut::new();
        moov.put_slice(&boxed(b"mvhd", &mvhd));
        moov.put_slice(&boxed(b"trak", &trak));
        boxed(b"moov", &moov)
    }

    fn build_avcc(&self, sps: &[u8], pps: &[u8]) -> BytesMut {
        let mut avcc = BytesMut::new();
        avcc.put_u8(1); // configuration version
        avcc.put_u8(sps.get(1).copied().unwrap_or(66)); // profile
        avcc.put_u8(sps.get(2).copied().unwrap_or(0)); // compatibility
        avcc.put_u8(sps.get(3).copied().unwrap_or(30)); // level
        avcc.put_u8(0xFF); // 4-byte NAL lengths
        avcc.put_u8(0xE1); // one SPS
        avcc.put_u16(sps.len() as u16);
        avcc.put_slice(sps);
        avcc.put_u8(1); // one PPS
        avcc.put_u16(pps.len() as u16);
        avcc.put_slice(pps);
        avcc
    }
}

fn boxed(fourcc: &[u8; 4], payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(8 + payload.len());
    out.put_u32((8 + payload.len()) as u32);
    out.put_slice(fourcc);
    out.put_slice(payload);
    out
}

fn put_identity_matrix(buf: &mut BytesMut) {
    for value in [0x00010000u32, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
        buf.put_u32(value);
    }
}

fn run_length(durations: &[u32]) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &duration in durations {
        match runs.last_mut() {
            Some((count, delta)) if *delta == duration => *count += 1,
            _ => runs.push((1, duration)),
        }
    }
    runs
}

/// Splits an Annex-B stream into NAL units, accepting both 3- and 4-byte
/// start codes.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut nal_start: Option<usize> = None;
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(start) = nal_start {
                let mut end = i;
                if end > start && data[end - 1] == 0 {
                    end -= 1;
                }
                nals.push(&data[start..end]);
            }
            nal_start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(start) = nal_start
        && start <= data.len()
    {
        nals.push(&data[start..]);
    }
    nals
}

#[cfg(test)]
mod tests {
    use super::{Mp4SegmentWriter, split_annexb};
    use tempfile::tempdir;

    const FAKE_SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1E, 0xAB, 0x40];
    const FAKE_PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    fn keyframe_annexb(payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(FAKE_SPS);
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(FAKE_PPS);
        data.extend_from_slice(&[0, 0, 1]);
        data.push(0x65);
        data.extend_from_slice(payload);
        data
    }

    fn delta_annexb(payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.push(0x41);
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn splits_mixed_start_codes() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1, 0x67, 0xAA]);
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xBB]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xCC, 0xDD]);
        let nals = split_annexb(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0], &[0x67, 0xAA]);
        assert_eq!(nals[1], &[0x68, 0xBB]);
        assert_eq!(nals[2], &[0x65, 0xCC, 0xDD]);
    }

    #[test]
    fn writes_a_structurally_complete_segment() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("seg.mp4");
        let mut writer = Mp4SegmentWriter::create(&path, 320, 240, 1000).expect("create");

        writer.append_sample(&keyframe_annexb(&[1, 2, 3, 4]), 0).expect("append");
        writer.append_sample(&delta_annexb(&[5, 6]), 1000).expect("append");
        writer.append_sample(&delta_annexb(&[7, 8, 9]), 2000).expect("append");
        assert_eq!(writer.sample_count(), 3);
        assert_eq!(writer.sync_sample_count(), 1);

        writer.finalize().expect("finalize");
        assert!(writer.is_finalized());

        let bytes = std::fs::read(&path).expect("segment bytes");
        assert_eq!(&bytes[4..8], b"ftyp");
        assert_eq!(&bytes[36..40], b"mdat");

        // mdat size was patched in: header + three length-prefixed samples.
        let mdat_size = u32::from_be_bytes(bytes[32..36].try_into().unwrap()) as usize;
        let sample_bytes = (4 + 5) + (4 + 3) + (4 + 4); // IDR kept, SPS/PPS lifted out
        assert_eq!(mdat_size, 8 + sample_bytes);

        // moov trails the data and carries the avcC parameter sets.
        let moov_at = bytes.windows(4).position(|w| w == b"moov").expect("moov");
        assert!(moov_at > 36);
        let avcc_at = bytes.windows(4).position(|w| w == b"avcC").expect("avcC");
        assert!(bytes[avcc_at..].windows(FAKE_SPS.len()).any(|w| w == FAKE_SPS));
        assert!(bytes[avcc_at..].windows(FAKE_PPS.len()).any(|w| w == FAKE_PPS));
    }

    #[test]
    fn sample_times_are_clamped_non_decreasing() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("seg.mp4");
        let mut writer = Mp4SegmentWriter::create(&path, 160, 120, 500).expect("create");

        writer.append_sample(&keyframe_annexb(&[1]), 100).expect("append");
        writer.append_sample(&delta_annexb(&[2]), 50).expect("append");
        writer.append_sample(&delta_annexb(&[3]), 400).expect("append");
        assert_eq!(writer.last_sample_time_ms(), Some(400));

        writer.finalize().expect("finalize");
    }

    #[test]
    fn finalize_requires_samples_and_parameter_sets() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("empty.mp4");
        let mut writer = Mp4SegmentWriter::create(&path, 160, 120, 500).expect("create");
        assert!(writer.finalize().is_err());

        let path = temp.path().join("no-ps.mp4");
        let mut writer = Mp4SegmentWriter::create(&path, 160, 120, 500).expect("create");
        writer.append_sample(&delta_annexb(&[9]), 0).expect("append");
        assert!(writer.finalize().is_err());
    }

    #[test]
    fn abort_removes_the_partial_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("aborted.mp4");
        let writer = Mp4SegmentWriter::create(&path, 160, 120, 500).expect("create");
        assert!(path.exists());
        writer.abort();
        assert!(!path.exists());
    }
}
