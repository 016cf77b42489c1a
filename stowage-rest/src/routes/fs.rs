//! Upload routes.

use std::io;

use actix_multipart::Multipart;
use actix_web::{
    http::header,
    web::{self, Data, Json, Path, Query, ServiceConfig},
    HttpMessage, HttpRequest, HttpResponse,
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};

use stowage::{
    merge,
    path::{FilePath, UploadId},
    protocol::{ChunkData, MergeData, MergeRequest, Reply, TaskInfo},
    queue::TaskStatus,
    range::ContentRange,
    stream::{self, DirectRequest, RangedRequest},
};

use crate::{errors::AppError, scope::SingleUser, settings::Settings, AppContext, AppResult};

pub fn config(cfg: &mut ServiceConfig) {
    cfg.service(web::resource("/put/chunk").route(web::put().to(put_chunk)))
        .service(web::resource("/put/chunk/merge").route(web::post().to(merge_chunks)))
        .service(web::resource("/put").route(web::put().to(put)))
        .service(web::resource("/form").route(web::put().to(put_form)))
        .service(web::resource("/task/{id}").route(web::get().to(task_status)))
        .service(web::resource("/settings").route(web::get().to(upload_settings)));
}

fn ok_json<T: Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(Reply::ok(data))
}

fn check_password(settings: &Settings, req: &HttpRequest) -> AppResult<()> {
    if let Some(expected) = &settings.password {
        let supplied = header_str(req, "Password");

        if supplied != Some(expected.as_str()) {
            return Err(AppError::Forbidden("wrong password".to_owned()));
        }
    }

    Ok(())
}

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn header_i64(req: &HttpRequest, name: &str) -> i64 {
    header_str(req, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

/// `Overwrite` header; plain PUTs replace by default.
fn header_overwrite(req: &HttpRequest) -> bool {
    header_str(req, "Overwrite") != Some("false")
}

fn file_path(req: &HttpRequest) -> AppResult<FilePath> {
    let raw = header_str(req, "File-Path")
        .ok_or_else(|| AppError::BadRequest("missing `File-Path` header".to_owned()))?;

    let decoded = urlencoding::decode(raw)
        .map_err(|_| AppError::BadRequest("`File-Path` is not valid percent-encoding".to_owned()))?;

    decoded
        .parse()
        .map_err(|e| AppError::BadRequest(format!("bad `File-Path`: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct ChunkParams {
    upload_id: UploadId,
    index: u64,
}

/// `PUT /fs/put/chunk?upload_id=…&index=…`: stage one slice.
pub async fn put_chunk(
    ctx: Data<AppContext>,
    settings: Data<Settings>,
    params: Query<ChunkParams>,
    mut payload: Multipart,
    req: HttpRequest,
) -> AppResult<HttpResponse> {
    check_password(&settings, &req)?;

    let declared = header_str(&req, "X-Chunk-CRC32").map(str::to_owned);

    while let Some(field) = payload
        .try_next()
        .await
        .map_err(|e| AppError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        if field.name() != "file" {
            continue;
        }

        let body = field.map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let crc32 = stowage::chunk::put_chunk(
            ctx.get_ref(),
            &params.upload_id,
            params.index,
            body,
            declared.as_deref(),
        )
        .await?;

        return Ok(ok_json(ChunkData { crc32 }));
    }

    Err(AppError::BadRequest("missing `file` part".to_owned()))
}

/// `POST /fs/put/chunk/merge`: concatenate staged slices and hand the
/// object to the backing store, inline or detached.
pub async fn merge_chunks(
    ctx: Data<AppContext>,
    settings: Data<Settings>,
    scope: Data<SingleUser>,
    body: Json<MergeRequest>,
    req: HttpRequest,
) -> AppResult<HttpResponse> {
    check_password(&settings, &req)?;

    let merge_req = body.into_inner();
    let plan = merge::plan(ctx.get_ref(), scope.get_ref(), &merge_req).await?;

    if merge_req.as_task {
        let id = merge::spawn(ctx.into_inner(), plan);
        let status = TaskStatus::Processing;

        return Ok(ok_json(MergeData {
            hash: None,
            task: Some(TaskInfo::from_status(id, &status)),
        }));
    }

    let hash = merge::run(ctx.get_ref(), &plan).await?;

    Ok(ok_json(MergeData {
        hash: Some(hash),
        task: None,
    }))
}

/// `PUT /fs/put`: with a `Content-Range` header, one slice of a
/// pipe-streamed session; without, a single-shot direct put.
pub async fn put(
    ctx: Data<AppContext>,
    settings: Data<Settings>,
    scope: Data<SingleUser>,
    payload: web::Payload,
    req: HttpRequest,
) -> AppResult<HttpResponse> {
    check_password(&settings, &req)?;

    let path = file_path(&req)?;
    let content_type = req.mime_type().unwrap_or(None);
    let last_modified = header_i64(&req, "Last-Modified");
    let overwrite = header_overwrite(&req);

    let body = payload.map_err(|e| io::Error::new(io::ErrorKind::Other, e));

    if let Some(raw_range) = header_str(&req, header::CONTENT_RANGE.as_str()) {
        let range: ContentRange = raw_range
            .parse()
            .map_err(|e| AppError::BadRequest(format!("bad `Content-Range`: {e}")))?;

        let progress = stream::put_ranged(
            &ctx.into_inner(),
            scope.get_ref(),
            &RangedRequest {
                path,
                range,
                content_type,
                last_modified,
                overwrite,
            },
            body,
        )
        .await?;

        return Ok(ok_json(progress));
    }

    let size = header_i64(&req, header::CONTENT_LENGTH.as_str()).max(0) as u64;

    stream::put_direct(
        &ctx.into_inner(),
        scope.get_ref(),
        &DirectRequest {
            path,
            size,
            content_type,
            last_modified,
            overwrite,
        },
        body,
    )
    .await?;

    Ok(ok_json(()))
}

/// `PUT /fs/form`: single-shot multipart put.
pub async fn put_form(
    ctx: Data<AppContext>,
    settings: Data<Settings>,
    scope: Data<SingleUser>,
    mut payload: Multipart,
    req: HttpRequest,
) -> AppResult<HttpResponse> {
    check_password(&settings, &req)?;

    let path = file_path(&req)?;
    let last_modified = header_i64(&req, "Last-Modified");
    let overwrite = header_overwrite(&req);

    while let Some(field) = payload
        .try_next()
        .await
        .map_err(|e| AppError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        if field.name() != "file" {
            continue;
        }

        let content_type = Some(field.content_type().clone());
        let body = field.map_err(|e| io::Error::new(io::ErrorKind::Other, e));

        stream::put_direct(
            &ctx.into_inner(),
            scope.get_ref(),
            &DirectRequest {
                path,
                size: 0,
                content_type,
                last_modified,
                overwrite,
            },
            body,
        )
        .await?;

        return Ok(ok_json(()));
    }

    Err(AppError::BadRequest("missing `file` part".to_owned()))
}

/// `GET /fs/task/{id}`: poll a detached merge.
pub async fn task_status(ctx: Data<AppContext>, id: Path<String>) -> AppResult<HttpResponse> {
    let id = id.into_inner();

    match ctx.tasks().status(&id) {
        Some(status) => Ok(ok_json(TaskInfo::from_status(id, &status))),
        None => Err(AppError::NotFound),
    }
}

/// `GET /fs/settings`: slice sizes for splitter clients.
pub async fn upload_settings(settings: Data<Settings>) -> AppResult<HttpResponse> {
    Ok(ok_json(settings.upload_settings()))
}
